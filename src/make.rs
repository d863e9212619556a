use crate::annotated::AnnotatedStr;
use crate::invocation::
{
    Invocation,
    StepFailure,
    StepError,
};
use crate::logger::
{
    BuildLogger,
    LogLevel,
    StandardLogger,
};
use crate::params::
{
    BuildOptions,
    ParameterRegistry,
};
use crate::persist::UpToDate;
use crate::resources::
{
    jobs_from_parameter,
    ResourcePool,
};
use crate::rules::StepRegistry;
use crate::runner::
{
    CommandRunner,
    OsRunner,
};
use crate::stat::StatCache;
use crate::system::real::RealSystem;
use crate::system::System;

use clap::
{
    Arg,
    ArgAction,
    Command,
};
use std::cell::
{
    Cell,
    RefCell,
};
use std::collections::
{
    HashMap,
    HashSet,
};
use std::rc::Rc;

/*  The default parameter configuration file to load when present. */
pub const DEFAULT_CONFIG : &str = "DynaMake.yaml";

struct SessionState<S : System>
{
    active : HashMap<String, Rc<Invocation<S>>>,
    up_to_date : HashMap<String, UpToDate>,
    phony : HashSet<String>,
    poisoned : HashSet<String>,
}

/*  One build session owns every piece of state the steps share: the frozen
    step registry, the resolved parameters, the stat cache, the resource
    pool, the single-flight table of active invocations, and the up-to-date,
    phony and poisoned target sets.  Everything is driven from one executor
    thread, so plain interior mutability suffices. */
pub struct BuildSession<S : System>
{
    pub options : BuildOptions,
    pub registry : StepRegistry<S>,
    pub stat : StatCache<S>,
    pub resources : ResourcePool,
    pub runner : Rc<dyn CommandRunner>,
    pub logger : Rc<dyn BuildLogger>,
    pub is_test : bool,
    state : RefCell<SessionState<S>>,
    actions_count : Cell<usize>,
    skipped_count : Cell<usize>,
}

impl<S : System> BuildSession<S>
{
    pub fn new(
        mut registry : StepRegistry<S>,
        options : BuildOptions,
        system : S,
        runner : Rc<dyn CommandRunner>,
        logger : Rc<dyn BuildLogger>,
        is_test : bool) -> Rc<BuildSession<S>>
    {
        registry.finalize();
        let resources = ResourcePool::new(jobs_from_parameter(options.jobs));

        Rc::new(BuildSession
        {
            options : options,
            registry : registry,
            stat : StatCache::new(system),
            resources : resources,
            runner : runner,
            logger : logger,
            is_test : is_test,
            state : RefCell::new(SessionState
            {
                active : HashMap::new(),
                up_to_date : HashMap::new(),
                phony : HashSet::new(),
                poisoned : HashSet::new(),
            }),
            actions_count : Cell::new(0),
            skipped_count : Cell::new(0),
        })
    }

    pub fn up_to_date(&self, path : &str) -> Option<UpToDate>
    {
        self.state.borrow().up_to_date.get(path).cloned()
    }

    pub fn set_up_to_date(&self, path : &str, up_to_date : UpToDate)
    {
        self.state.borrow_mut().up_to_date.insert(path.to_string(), up_to_date);
    }

    pub fn is_poisoned(&self, path : &str) -> bool
    {
        self.state.borrow().poisoned.contains(path)
    }

    /*  A poisoned path can not simultaneously count as up-to-date. */
    pub fn poison(&self, path : &str)
    {
        let mut state = self.state.borrow_mut();
        state.up_to_date.remove(path);
        state.poisoned.insert(path.to_string());
    }

    pub fn is_phony(&self, path : &str) -> bool
    {
        self.state.borrow().phony.contains(path)
    }

    pub fn mark_phony(&self, path : &str)
    {
        self.state.borrow_mut().phony.insert(path.to_string());
    }

    pub fn active(&self, name : &str) -> Option<Rc<Invocation<S>>>
    {
        self.state.borrow().active.get(name).cloned()
    }

    pub fn set_active(&self, invocation : Rc<Invocation<S>>)
    {
        self.state.borrow_mut().active
            .insert(invocation.name.clone(), invocation);
    }

    pub fn remove_active(&self, name : &str)
    {
        self.state.borrow_mut().active.remove(name);
    }

    pub fn active_count(&self) -> usize
    {
        self.state.borrow().active.len()
    }

    pub fn count_action(&self)
    {
        self.actions_count.set(self.actions_count.get() + 1);
    }

    pub fn count_skipped(&self)
    {
        self.skipped_count.set(self.skipped_count.get() + 1);
    }

    pub fn actions_count(&self) -> usize
    {
        self.actions_count.get()
    }

    pub fn skipped_count(&self) -> usize
    {
        self.skipped_count.get()
    }
}

/*  Drive the requested targets to an up-to-date state through a synthetic
    root invocation.  Returns the first fatal, if any. */
pub async fn build_targets<S : System + 'static>(
    session : &Rc<BuildSession<S>>,
    targets : &[AnnotatedStr]) -> Option<StepFailure>
{
    let root = Invocation::root(session.clone());

    session.logger.log(LogLevel::Trace, &format!(
        "{} - Targets: {}",
        root.log_label(),
        targets.iter()
            .map(|target| target.as_str())
            .collect::<Vec<&str>>()
            .join(" ")));

    if session.logger.enabled(LogLevel::Debug)
    {
        session.logger.log(LogLevel::Debug, &format!(
            "{} - Available resources: {}",
            root.log_label(), session.resources.describe_available()));
    }

    let mut failure = None;
    for target in targets
    {
        match root.clone().require(target.clone())
        {
            Ok(()) => {},
            Err(StepError::Failed(found)) =>
            {
                failure = Some(found);
                break;
            },
            Err(StepError::Restart) => {},
        }
    }

    if failure.is_none()
    {
        match root.sync().await
        {
            Ok(()) => {},
            Err(StepError::Failed(found)) => failure = Some(found),
            Err(StepError::Restart) => {},
        }
    }

    if failure.is_none()
    {
        failure = root.exception();
    }

    match &failure
    {
        Some(_) =>
        {
            session.logger.log(LogLevel::Error, &format!(
                "{} - Fail", root.log_label()));
        },
        None =>
        {
            if session.actions_count() > 0
            {
                session.logger.log(LogLevel::Trace, &format!(
                    "{} - Done", root.log_label()));
            }
            else if session.skipped_count() > 0
            {
                session.logger.log(LogLevel::Trace, &format!(
                    "{} - Skipped", root.log_label()));
            }
            else
            {
                session.logger.log(LogLevel::Trace, &format!(
                    "{} - Complete", root.log_label()));
            }
        },
    }

    failure
}

/*  What a program built on the engine passes to make() besides its steps. */
pub struct MakeConfig
{
    /*  Built when no targets are named on the command line. */
    pub default_targets : Vec<String>,

    /*  Integer parameters that back pool resources, with the default amount
        charged to each action that does not name them. */
    pub resources : Vec<(String, usize)>,
}

impl Default for MakeConfig
{
    fn default() -> MakeConfig
    {
        MakeConfig
        {
            default_targets : vec!["all".to_string()],
            resources : vec![],
        }
    }
}

/*  The generic main function: parse the command line, layer the
    configuration, and build.  Returns the process exit status. */
pub fn make(
    registry : StepRegistry<RealSystem>,
    params : ParameterRegistry,
    config : MakeConfig) -> i32
{
    let arguments : Vec<String> = std::env::args().collect();
    make_with_arguments(registry, params, config, arguments)
}

fn make_with_arguments(
    registry : StepRegistry<RealSystem>,
    mut params : ParameterRegistry,
    config : MakeConfig,
    arguments : Vec<String>) -> i32
{
    let mut command = Command::new("dynamake")
        .about("A dynamic build engine: rules discover their dependencies \
            while they run")
        .arg(Arg::new("TARGET")
            .num_args(0..)
            .help(format!(
                "The file or target to make (default: {})",
                config.default_targets.join(" "))))
        .arg(Arg::new("config")
            .long("config")
            .short('c')
            .value_name("FILE")
            .action(ArgAction::Append)
            .help("Load a parameters configuration YAML file"))
        .arg(Arg::new("list_steps")
            .long("list-steps")
            .action(ArgAction::SetTrue)
            .help("List all the build steps and their outputs, and exit"));

    let parameter_names : Vec<String> = params
        .parameters()
        .map(|parameter| parameter.name.clone())
        .collect();

    for parameter in params.parameters()
    {
        let mut argument = Arg::new(parameter.name.clone())
            .long(parameter.name.clone())
            .value_name(parameter.metavar.clone())
            .help(format!(
                "{} (default: {})", parameter.description, parameter.default));
        if let Some(short) = parameter.short
        {
            argument = argument.short(short);
        }
        command = command.arg(argument);
    }

    let matches = command.get_matches_from(arguments);
    let system = RealSystem::new();

    if system.is_file(DEFAULT_CONFIG)
    {
        match params.load_config(&system, DEFAULT_CONFIG)
        {
            Ok(()) => {},
            Err(error) =>
            {
                eprintln!("{}", error);
                return 1;
            },
        }
    }

    if let Some(paths) = matches.get_many::<String>("config")
    {
        for path in paths
        {
            match params.load_config(&system, path)
            {
                Ok(()) => {},
                Err(error) =>
                {
                    eprintln!("{}", error);
                    return 1;
                },
            }
        }
    }

    for name in parameter_names
    {
        if let Some(text) = matches.get_one::<String>(&name)
        {
            match params.set_from_text(&name, text)
            {
                Ok(()) => {},
                Err(error) =>
                {
                    eprintln!("{}", error);
                    return 1;
                },
            }
        }
    }

    let options = match BuildOptions::from_registry(&params)
    {
        Ok(options) => options,
        Err(error) =>
        {
            eprintln!("{}", error);
            return 1;
        },
    };

    if matches.get_flag("list_steps")
    {
        println!("{}", registry.list_steps());
        return 0;
    }

    let logger = Rc::new(StandardLogger::new(options.log_level));
    let session = BuildSession::new(
        registry,
        options,
        system,
        Rc::new(OsRunner::new()),
        logger,
        false);

    for (name, default_amount) in config.resources
    {
        let total = match params.int_value(&name)
        {
            Ok(total) if total >= 0 => total as usize,
            Ok(_) => 0,
            Err(error) =>
            {
                eprintln!("{}", error);
                return 1;
            },
        };
        match session.resources.register(&name, total, default_amount)
        {
            Ok(()) => {},
            Err(error) =>
            {
                eprintln!("{}", error);
                return 1;
            },
        }
    }

    let targets : Vec<AnnotatedStr> = match matches.get_many::<String>("TARGET")
    {
        Some(targets) => targets.map(|target| AnnotatedStr::new(target.clone())).collect(),
        None => config.default_targets.iter()
            .map(|target| AnnotatedStr::new(target.clone()))
            .collect(),
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) =>
        {
            eprintln!("Failed to start the build executor: {}", error);
            return 1;
        },
    };

    let local = tokio::task::LocalSet::new();
    let failure = runtime.block_on(
        local.run_until(build_targets(&session, &targets)));

    match failure
    {
        Some(_) => 1,
        None => 0,
    }
}
