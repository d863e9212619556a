use crate::annotated::AnnotatedStr;
use crate::logger::
{
    colored,
    LogLevel,
};
use crate::make::BuildSession;
use crate::patterns::
{
    Bindings,
    Captured,
    clean_path,
    format_template,
    glob_capture,
    glob_paths,
    PatternError,
    substitute,
};
use crate::persist::
{
    self,
    nanoseconds_to_string,
    PersistentAction,
    UpToDate,
};
use crate::resources::
{
    Amounts,
    amounts_to_string,
};
use crate::rules::
{
    canonical_name,
    Step,
};
use crate::runner::
{
    ActionKind,
    shell_quote,
};
use crate::system::System;

use futures::future::join_all;
use std::cell::
{
    Cell,
    RefCell,
};
use std::fmt;
use std::rc::Rc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/*  The first fatal reason a step saw.  Cheap to clone so it can be stored on
    the invocation, returned to waiters, and propagated to the parent all at
    once. */
#[derive(Clone, Debug)]
pub struct StepFailure
{
    reason : Rc<String>,
}

impl StepFailure
{
    pub fn new(reason : String) -> StepFailure
    {
        StepFailure
        {
            reason : Rc::new(reason),
        }
    }

    pub fn reason(&self) -> &str
    {
        &self.reason
    }
}

impl fmt::Display for StepFailure
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        write!(formatter, "{}", self.reason)
    }
}

/*  What a step handler sees out of engine calls.  Restart is not a failure:
    it tells the invocation's dispatcher that previously skipped actions must
    now run, so the handler is re-entered from the top with must-run set. */
#[derive(Clone, Debug)]
pub enum StepError
{
    Failed(StepFailure),
    Restart,
}

impl fmt::Display for StepError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            StepError::Failed(failure) => write!(formatter, "{}", failure),
            StepError::Restart => write!(formatter, "restart to run skipped action(s)"),
        }
    }
}

pub type StepResult<T> = Result<T, StepError>;

/*  Convenience for writing plain command words. */
pub fn words(parts : &[&str]) -> Vec<AnnotatedStr>
{
    parts.iter().map(|part| AnnotatedStr::new(*part)).collect()
}

/*  Per-action knobs beyond the command itself. */
#[derive(Clone, Debug, Default)]
pub struct ActionOptions
{
    /*  A non-zero exit status is not a failure. */
    pub ignore_exit_status : bool,

    /*  Override of the default_shell_prefix parameter, for shell actions. */
    pub prefix : Option<String>,

    /*  Explicit resource amounts; everything else is charged defaults. */
    pub resources : Amounts,
}

struct State
{
    required : Vec<AnnotatedStr>,
    async_actions : Vec<JoinHandle<Option<StepFailure>>>,
    newest_input_path : Option<String>,
    newest_input_mtime_ns : u64,
    initial_outputs : Vec<AnnotatedStr>,
    phony_outputs : Vec<AnnotatedStr>,
    built_outputs : Vec<String>,
    missing_output : Option<String>,
    abandoned_output : Option<String>,
    oldest_output_path : Option<String>,
    oldest_output_mtime_ns : u64,
    exception : Option<StepFailure>,
    old_persistent_actions : Vec<PersistentAction>,
    old_persistent_outputs : Vec<String>,
    new_persistent_actions : Vec<PersistentAction>,
    must_run_action : bool,
    did_skip_actions : bool,
    did_run_actions : bool,
    should_remove_stale_outputs : bool,
}

impl State
{
    fn new(should_remove_stale_outputs : bool) -> State
    {
        State
        {
            required : vec![],
            async_actions : vec![],
            newest_input_path : None,
            newest_input_mtime_ns : 0,
            initial_outputs : vec![],
            phony_outputs : vec![],
            built_outputs : vec![],
            missing_output : None,
            abandoned_output : None,
            oldest_output_path : None,
            oldest_output_mtime_ns : 0,
            exception : None,
            old_persistent_actions : vec![],
            old_persistent_outputs : vec![],
            new_persistent_actions : vec![],
            must_run_action : false,
            did_skip_actions : false,
            did_run_actions : false,
            should_remove_stale_outputs : should_remove_stale_outputs,
        }
    }
}

/*  A runtime instance of a step at a specific binding.  At most one
    invocation per canonical name is ever active; later requirers of the same
    name attach to the active one and wait for its completion notification.
    The parent link exists for cycle detection and stack labels only, never
    for state. */
pub struct Invocation<S : System>
{
    session : Rc<BuildSession<S>>,
    step : Option<Rc<Step<S>>>,
    parent : Option<Rc<Invocation<S>>>,
    pub name : String,
    bindings : Bindings,
    stack : String,
    log_label : String,
    sub_count : Cell<usize>,
    state : RefCell<State>,
    completed : Cell<bool>,
    condition : Notify,
}

impl<S : System + 'static> Invocation<S>
{
    /*  The synthetic root invocation the driver requires targets through. */
    pub fn root(session : Rc<BuildSession<S>>) -> Rc<Invocation<S>>
    {
        let log_label =
        if session.is_test
        {
            "#0 - make".to_string()
        }
        else
        {
            "make".to_string()
        };

        let should_remove = session.options.remove_stale_outputs;
        Rc::new(Invocation
        {
            session : session,
            step : None,
            parent : None,
            name : "make".to_string(),
            bindings : Bindings::new(),
            stack : "#0".to_string(),
            log_label : log_label,
            sub_count : Cell::new(0),
            state : RefCell::new(State::new(should_remove)),
            completed : Cell::new(false),
            condition : Notify::new(),
        })
    }

    fn new(
        parent : &Rc<Invocation<S>>,
        step : Rc<Step<S>>,
        bindings : Bindings) -> Result<Rc<Invocation<S>>, StepFailure>
    {
        let session = parent.session.clone();
        let name = canonical_name(&step.name, &bindings);

        /*  Walking the parent chain catches a step that, through any number
            of intermediaries, requires its own output. */
        let mut call_chain = vec![name.clone()];
        let mut ancestor = Some(parent.clone());
        while let Some(current) = ancestor
        {
            call_chain.push(current.name.clone());
            if current.name == name
            {
                call_chain.reverse();
                return Err(StepFailure::new(
                    format!("step invokes itself: {}", call_chain.join(" -> "))));
            }
            ancestor = current.parent.clone();
        }

        parent.sub_count.set(parent.sub_count.get() + 1);
        let stack =
        if parent.stack == "#0"
        {
            format!("#{}", parent.sub_count.get())
        }
        else
        {
            format!("{}.{}", parent.stack, parent.sub_count.get())
        };

        let log_label =
        if session.is_test
        {
            format!("{} - {}", stack, name)
        }
        else
        {
            name.clone()
        };

        let should_remove = session.options.remove_stale_outputs;
        Ok(Rc::new(Invocation
        {
            session : session,
            step : Some(step),
            parent : Some(parent.clone()),
            name : name,
            bindings : bindings,
            stack : stack,
            log_label : log_label,
            sub_count : Cell::new(0),
            state : RefCell::new(State::new(should_remove)),
            completed : Cell::new(false),
            condition : Notify::new(),
        }))
    }

    pub fn log_label(&self) -> &str
    {
        &self.log_label
    }

    pub fn exception(&self) -> Option<StepFailure>
    {
        self.state.borrow().exception.clone()
    }

    fn log(&self, level : LogLevel, message : &str)
    {
        self.session.logger.log(
            level, &format!("{} - {}", self.log_label, message));
    }

    fn log_enabled(&self, level : LogLevel) -> bool
    {
        self.session.logger.enabled(level)
    }

    fn tracking(&self) -> bool
    {
        ! self.state.borrow().new_persistent_actions.is_empty()
    }

    /*  Record the fatal reason.  Whether the caller keeps unwinding depends
        on the failure_aborts_build parameter; the stored exception
        short-circuits everything either way. */
    fn abort(&self, reason : String) -> StepResult<()>
    {
        let failure = StepFailure::new(reason);
        self.state.borrow_mut().exception = Some(failure.clone());
        if self.session.options.failure_aborts_build
        {
            return Err(StepError::Failed(failure));
        }
        Ok(())
    }

    fn log_and_abort(&self, reason : String) -> StepResult<()>
    {
        self.session.logger.log(LogLevel::Error, &reason);
        self.abort(reason)
    }

    fn pattern_abort(&self, error : PatternError) -> StepError
    {
        self.hard_abort(format!("{} - {}", self.log_label, error))
    }

    /*  For malformed patterns and invalid resource requests: programming
        errors that stop this step no matter what failure_aborts_build
        says. */
    fn hard_abort(&self, reason : String) -> StepError
    {
        self.session.logger.log(LogLevel::Error, &reason);
        let failure = StepFailure::new(reason);
        self.state.borrow_mut().exception = Some(failure.clone());
        StepError::Failed(failure)
    }

    /*  Require a target to be up-to-date before any action runs or the
        invocation completes.  Never suspends: derived targets spawn (or
        attach to) child invocations which sync() awaits later. */
    pub fn require(self : Rc<Self>, path : AnnotatedStr) -> StepResult<()>
    {
        let path = clean_path(&path);

        self.log(LogLevel::Debug, &format!("Build the required: {}", path));
        self.state.borrow_mut().required.push(path.clone());

        if self.session.is_poisoned(&path)
        {
            return self.abort(format!(
                "{} - The required: {} has failed to build", self.log_label, path));
        }

        if let Some(up_to_date) = self.session.up_to_date(&path)
        {
            self.log(LogLevel::Debug, &format!("The required: {} was built", path));
            if self.tracking()
            {
                self.with_last_persistent_action(
                    |action| action.require(
                        &path, UpToDate::new(&up_to_date.producer, 0)));
            }
            return Ok(());
        }

        let resolution = match self.session.registry.resolve(&path)
        {
            Ok(resolution) => resolution,
            Err(error) => return self.log_and_abort(format!("{}", error)),
        };

        let (step, bindings) = match resolution
        {
            Some((step, bindings)) => (step, bindings),
            None =>
            {
                return match self.session.stat.try_stat(&path)
                {
                    Some(file_stat) =>
                    {
                        self.log(LogLevel::Debug,
                            &format!("The required: {} is a source file", path));
                        let up_to_date = UpToDate::source(file_stat.mtime_ns);
                        self.session.set_up_to_date(&path, up_to_date.clone());
                        if self.tracking()
                        {
                            self.with_last_persistent_action(
                                |action| action.require(&path, up_to_date.clone()));
                        }
                        Ok(())
                    },
                    None =>
                    {
                        if path.optional
                        {
                            self.log(LogLevel::Debug, &format!(
                                "The optional required: {} does not exist \
                                 and can't be built", path));
                            Ok(())
                        }
                        else
                        {
                            self.log_and_abort(format!(
                                "{} - Don't know how to make the required: {}",
                                self.log_label, path))
                        }
                    },
                };
            },
        };

        let invocation = match Invocation::new(&self, step, bindings)
        {
            Ok(invocation) => invocation,
            Err(failure) => return self.log_and_abort(failure.reason().to_string()),
        };

        if self.tracking()
        {
            self.with_last_persistent_action(
                |action| action.require(&path, UpToDate::new(&invocation.name, 0)));
        }

        self.log(LogLevel::Debug, &format!(
            "The required: {} will be produced by the spawned: {}",
            path, invocation.log_label));

        let handle = tokio::task::spawn_local(invocation.run());
        self.state.borrow_mut().async_actions.push(handle);
        Ok(())
    }

    fn with_last_persistent_action<F : FnMut(&mut PersistentAction)>(
        &self, mut operate : F)
    {
        let mut state = self.state.borrow_mut();
        if let Some(action) = state.new_persistent_actions.last_mut()
        {
            operate(action);
        }
    }

    /*  Actually run the invocation: this is the spawned task of one step at
        one binding.  Returns the failure, if any, for the parent's sync. */
    pub async fn run(self : Rc<Self>) -> Option<StepFailure>
    {
        if let Some(active) = self.session.active(&self.name)
        {
            return self.wait_for(active).await;
        }

        self.log(LogLevel::Trace, "Call");

        if self.session.options.rebuild_changed_actions
        {
            self.state.borrow_mut().new_persistent_actions.push(PersistentAction::new());
            self.read_old_persistent_actions();
        }

        self.session.set_active(self.clone());

        let result = self.clone().work().await;
        match result
        {
            Ok(()) => {},
            Err(StepError::Failed(failure)) =>
            {
                let mut state = self.state.borrow_mut();
                if state.exception.is_none()
                {
                    state.exception = Some(failure);
                }
            },
            Err(StepError::Restart) =>
            {
                /*  A restart past the dispatcher means the handler swallowed
                    and re-threw it; treat it as a failure rather than loop. */
                let failure = StepFailure::new(format!(
                    "{} - Unexpected restart", self.log_label));
                let mut state = self.state.borrow_mut();
                if state.exception.is_none()
                {
                    state.exception = Some(failure);
                }
            },
        }

        let exception = self.exception();
        if exception.is_none()
        {
            self.finish_success();
        }
        else
        {
            self.finish_failure().await;
        }

        self.session.remove_active(&self.name);
        self.completed.set(true);
        self.condition.notify_waiters();

        self.exception()
    }

    async fn work(self : Rc<Self>) -> StepResult<()>
    {
        let step = match &self.step
        {
            Some(step) => step.clone(),
            None => return Ok(()),
        };

        self.collect_initial_outputs()?;

        let context = Context
        {
            invocation : self.clone(),
        };
        match (step.handler)(context).await
        {
            Ok(()) => {},
            Err(StepError::Restart) =>
            {
                self.restart();
                let context = Context
                {
                    invocation : self.clone(),
                };
                (step.handler)(context).await?;
            },
            Err(error) => return Err(error),
        }

        self.sync().await?;
        if self.exception().is_none()
        {
            self.collect_final_outputs().await?;
        }
        Ok(())
    }

    /*  Reset the per-run state so the handler can be re-entered with
        must-run set, executing every command it previously skipped. */
    fn restart(&self)
    {
        self.log(LogLevel::Debug, "Must restart step to run skipped action(s)");

        let mut state = self.state.borrow_mut();
        state.required.clear();
        state.async_actions.clear();
        state.newest_input_path = None;
        state.newest_input_mtime_ns = 0;
        state.abandoned_output = None;
        state.oldest_output_path = None;
        state.oldest_output_mtime_ns = 0;
        if ! state.new_persistent_actions.is_empty()
        {
            state.new_persistent_actions = vec![PersistentAction::new()];
        }
        state.must_run_action = true;
        state.did_skip_actions = false;
    }

    /*  Read what the last successful run did.  These are only advisory: any
        problem reading them just forces the actions to run. */
    fn read_old_persistent_actions(&self)
    {
        let directory = &self.session.options.persistent_directory;
        let path = persist::log_path(directory, &self.name);

        match persist::read(self.session.stat.system(), directory, &self.name)
        {
            persist::LoadResult::Missing =>
            {
                self.log(LogLevel::Why, &format!(
                    "Must run actions because missing the persistent actions: {}",
                    path));
                self.state.borrow_mut().must_run_action = true;
            },

            persist::LoadResult::Invalid(_reason) =>
            {
                self.session.logger.log(LogLevel::Warn, &format!(
                    "{} - Must run actions because read the invalid \
                     persistent actions: {}", self.log_label, path));
                self.state.borrow_mut().must_run_action = true;
            },

            persist::LoadResult::Loaded{actions, outputs} =>
            {
                self.log(LogLevel::Debug, &format!(
                    "Read the persistent actions: {}", path));
                let mut state = self.state.borrow_mut();
                state.old_persistent_actions = actions;
                state.old_persistent_outputs = outputs;
            },
        }
    }

    fn write_new_persistent_actions(&self)
    {
        let directory = &self.session.options.persistent_directory;
        let path = persist::log_path(directory, &self.name);
        self.log(LogLevel::Debug, &format!(
            "Write the persistent actions: {}", path));

        let (actions, outputs) =
        {
            let state = self.state.borrow();
            (state.new_persistent_actions.clone(), state.built_outputs.clone())
        };

        match persist::write(
            self.session.stat.system(), directory, &self.name, &actions, &outputs)
        {
            Ok(()) => {},
            Err(error) =>
            {
                self.session.logger.log(LogLevel::Warn, &format!(
                    "{} - Failed to write the persistent actions: {}: {}",
                    self.log_label, path, error));
            },
        }
    }

    fn remove_old_persistent_data(&self)
    {
        let directory = &self.session.options.persistent_directory;
        let path = persist::log_path(directory, &self.name);
        if self.session.stat.system().is_file(&path)
        {
            self.log(LogLevel::Debug, &format!(
                "Remove the persistent actions: {}", path));
        }
        persist::remove(self.session.stat.system(), directory, &self.name);
    }

    fn finish_success(&self)
    {
        let tracking = self.tracking();
        if tracking
        {
            let (did_skip, shrunk) =
            {
                let mut state = self.state.borrow_mut();
                if state.new_persistent_actions.len() > 1
                    && state.new_persistent_actions
                        .last()
                        .map(PersistentAction::is_empty)
                        == Some(true)
                {
                    state.new_persistent_actions.pop();
                }
                (state.did_skip_actions,
                    state.new_persistent_actions.len()
                        < state.old_persistent_actions.len())
            };

            if ! did_skip
            {
                self.write_new_persistent_actions();
            }
            else if shrunk
            {
                self.session.logger.log(LogLevel::Warn, &format!(
                    "{} - Skipped some action(s) even though it has changed \
                     to remove some final action(s)", self.log_label));
            }
        }

        let state = self.state.borrow();
        if state.did_run_actions
        {
            self.log(LogLevel::Trace, "Done");
        }
        else if state.did_skip_actions
        {
            self.log(LogLevel::Trace, "Skipped");
        }
        else
        {
            self.log(LogLevel::Trace, "Complete");
        }
    }

    async fn finish_failure(&self)
    {
        /*  Children already in flight are allowed to end normally; their
            failures fold into this already-failed invocation silently. */
        loop
        {
            let handle = self.state.borrow_mut().async_actions.pop();
            match handle
            {
                Some(handle) =>
                {
                    match handle.await
                    {
                        Ok(_) => {},
                        Err(_) => {},
                    }
                },
                None => break,
            }
        }

        self.poison_all_outputs();
        self.remove_old_persistent_data();
        self.log(LogLevel::Trace, "Fail");
    }

    /*  Wait until the already-active invocation of this name is done; used
        by every later requirer of the same target. */
    async fn wait_for(&self, active : Rc<Invocation<S>>) -> Option<StepFailure>
    {
        self.log(LogLevel::Debug, &format!(
            "Paused by waiting for: {}", active.log_label));

        while ! active.completed.get()
        {
            active.condition.notified().await;
        }

        self.log(LogLevel::Debug, &format!(
            "Resumed by completion of: {}", active.log_label));

        active.exception()
    }

    /*  Check which outputs already exist and how old they are, before the
        handler gets a chance to run anything. */
    fn collect_initial_outputs(&self) -> StepResult<()>
    {
        let step = match &self.step
        {
            Some(step) => step.clone(),
            None => return Ok(()),
        };

        let mut outputs = step.outputs.clone();
        outputs.sort();

        let mut missing_output_matchers = vec![];
        for pattern in outputs.iter()
        {
            let formatted = match substitute(&self.bindings, pattern)
            {
                Ok(formatted) => formatted,
                Err(error) => return Err(self.pattern_abort(error)),
            };

            if formatted.phony
            {
                self.session.mark_phony(&formatted);
                self.state.borrow_mut().phony_outputs.push(formatted);
                continue;
            }

            match glob_paths(&self.session.stat, &[formatted.clone()])
            {
                Ok(paths) =>
                {
                    if paths.is_empty()
                    {
                        self.log(LogLevel::Debug, &format!(
                            "Nonexistent optional output(s): {}", pattern));
                    }
                    for path in paths
                    {
                        if path.as_str() == formatted.as_str()
                        {
                            self.log(LogLevel::Debug, &format!(
                                "Existing output: {}", path));
                        }
                        else
                        {
                            self.log(LogLevel::Debug, &format!(
                                "Existing output: {} -> {}", pattern, path));
                        }
                        self.state.borrow_mut().initial_outputs.push(path);
                    }
                },

                Err(crate::patterns::GlobError::NonOptionalPatternDidNotMatch{..}) =>
                {
                    self.log(LogLevel::Debug, &format!(
                        "Nonexistent required output(s): {}", pattern));
                    let matcher = match crate::patterns::capture_regex(formatted.as_str())
                    {
                        Ok(matcher) => matcher,
                        Err(error) => return Err(self.pattern_abort(error)),
                    };
                    missing_output_matchers.push(matcher);
                    self.state.borrow_mut().missing_output =
                        Some(formatted.into_string());
                },

                Err(error) =>
                {
                    return Err(self.hard_abort(format!(
                        "{} - {}", self.log_label, error)));
                },
            }
        }

        if self.tracking()
        {
            let old_outputs = self.state.borrow().old_persistent_outputs.clone();
            for path in old_outputs
            {
                if self.state.borrow().initial_outputs.iter()
                    .any(|output| output.as_str() == path)
                {
                    continue;
                }

                if missing_output_matchers.iter()
                    .any(|matcher| matcher.is_match(&path))
                {
                    continue;
                }

                if self.session.stat.exists(&path)
                {
                    self.log(LogLevel::Debug, &format!(
                        "Changed to abandon the output: {}", path));
                    self.state.borrow_mut().abandoned_output = Some(path.clone());
                }
                else
                {
                    self.log(LogLevel::Debug, &format!(
                        "Missing the old built output: {}", path));
                    self.state.borrow_mut().missing_output = Some(path.clone());
                }

                self.session.stat.forget(&path);
            }
        }

        {
            let state = self.state.borrow();
            if state.must_run_action
                || ! state.phony_outputs.is_empty()
                || state.missing_output.is_some()
                || state.abandoned_output.is_some()
            {
                return Ok(());
            }
        }

        let mut initial_outputs = self.state.borrow().initial_outputs.clone();
        initial_outputs.sort();
        for output in initial_outputs
        {
            if output.exists_only
            {
                continue;
            }
            let file_stat = match self.session.stat.stat(&output)
            {
                Ok(file_stat) => file_stat,
                Err(error) => return self.log_and_abort(format!(
                    "{} - The output: {} is not accessible: {}",
                    self.log_label, output, error)),
            };

            let mut state = self.state.borrow_mut();
            if state.oldest_output_path.is_none()
                || state.oldest_output_mtime_ns > file_stat.mtime_ns
            {
                state.oldest_output_path = Some(output.as_str().to_string());
                state.oldest_output_mtime_ns = file_stat.mtime_ns;
            }
        }

        if self.log_enabled(LogLevel::Debug)
        {
            let state = self.state.borrow();
            if let Some(oldest) = &state.oldest_output_path
            {
                self.log(LogLevel::Debug, &format!(
                    "Oldest output: {} time: {}",
                    oldest, nanoseconds_to_string(state.oldest_output_mtime_ns)));
            }
        }

        Ok(())
    }

    /*  After the handler is done: make sure every required output actually
        exists now, and publish all of them to the up-to-date map. */
    async fn collect_final_outputs(&self) -> StepResult<()>
    {
        let step = match &self.step
        {
            Some(step) => step.clone(),
            None => return Ok(()),
        };

        let mut outputs = step.outputs.clone();
        outputs.sort();

        let mut missing_outputs = false;
        let mut did_sleep = false;

        for pattern in outputs.iter()
        {
            let formatted = match substitute(&self.bindings, pattern)
            {
                Ok(formatted) => formatted,
                Err(error) => return Err(self.pattern_abort(error)),
            };

            if pattern.phony
            {
                let mtime_ns = self.state.borrow().newest_input_mtime_ns + 1;
                self.session.set_up_to_date(
                    &formatted, UpToDate::new(&self.name, mtime_ns));
                continue;
            }

            match glob_paths(&self.session.stat, &[formatted.clone()])
            {
                Ok(paths) =>
                {
                    if paths.is_empty()
                    {
                        self.log(LogLevel::Debug, &format!(
                            "Did not make the optional output(s): {}", pattern));
                    }
                    for path in paths
                    {
                        self.state.borrow_mut().built_outputs
                            .push(path.as_str().to_string());

                        if self.session.options.touch_success_outputs
                        {
                            if ! did_sleep
                            {
                                /*  Guarantees monotonicity on filesystems
                                    with coarse timestamps. */
                                tokio::time::sleep(Duration::from_secs(1)).await;
                                did_sleep = true;
                            }
                            self.log(LogLevel::File, &format!(
                                "Touch the output: {}", path));
                            match self.session.stat.touch(&path)
                            {
                                Ok(()) => {},
                                Err(error) => return self.log_and_abort(format!(
                                    "{} - Failed to touch the output: {}: {}",
                                    self.log_label, path, error)),
                            }
                        }

                        let file_stat = match self.session.stat.stat(&path)
                        {
                            Ok(file_stat) => file_stat,
                            Err(error) => return self.log_and_abort(format!(
                                "{} - The output: {} is not accessible: {}",
                                self.log_label, path, error)),
                        };
                        self.session.set_up_to_date(
                            &path, UpToDate::new(&self.name, file_stat.mtime_ns));

                        if self.log_enabled(LogLevel::Debug)
                        {
                            if path.as_str() == formatted.as_str()
                            {
                                self.log(LogLevel::Debug, &format!(
                                    "Has the output: {} time: {}",
                                    path, nanoseconds_to_string(file_stat.mtime_ns)));
                            }
                            else
                            {
                                self.log(LogLevel::Debug, &format!(
                                    "Has the output: {} -> {} time: {}",
                                    pattern, path,
                                    nanoseconds_to_string(file_stat.mtime_ns)));
                            }
                        }
                    }
                },

                Err(crate::patterns::GlobError::NonOptionalPatternDidNotMatch{..}) =>
                {
                    self.session.logger.log(LogLevel::Error, &format!(
                        "{} - Missing the output(s): {}", self.log_label, pattern));
                    missing_outputs = true;
                    break;
                },

                Err(error) =>
                {
                    return self.log_and_abort(format!(
                        "{} - {}", self.log_label, error));
                },
            }
        }

        if missing_outputs
        {
            return self.abort(format!(
                "{} - Missing some output(s)", self.log_label));
        }
        Ok(())
    }

    /*  Delete the outputs left over from a previous run, before the first
        action of this run.  Precious outputs are spared, merely forgotten
        from the stat cache so their fresh state gets re-read. */
    fn remove_stale_outputs(&self)
    {
        let (paths, should_remove) =
        {
            let state = self.state.borrow();
            let mut paths = state.initial_outputs.clone();
            paths.sort();
            (paths, state.should_remove_stale_outputs)
        };

        for path in paths
        {
            if should_remove && ! path.precious
            {
                self.log(LogLevel::File, &format!(
                    "Remove the stale output: {}", path));
                self.remove_output(&path);
            }
            else
            {
                self.session.stat.forget(&path);
            }
        }

        self.state.borrow_mut().should_remove_stale_outputs = false;
    }

    fn remove_output(&self, path : &str)
    {
        match self.session.stat.remove(path)
        {
            Ok(()) => {},
            Err(_) => return,
        }

        let mut path = path.to_string();
        while self.session.options.remove_empty_directories
        {
            let parent = match path.rfind('/')
            {
                Some(position) => path[..position].to_string(),
                None => return,
            };
            match self.session.stat.rmdir(&parent)
            {
                Ok(()) =>
                {
                    self.log(LogLevel::File, &format!(
                        "Remove the empty directory: {}", parent));
                },
                Err(_) => return,
            }
            path = parent;
        }
    }

    /*  A failed step marks every declared output as poisoned so dependents
        fail fast, and typically deletes the files themselves. */
    fn poison_all_outputs(&self)
    {
        let step = match &self.step
        {
            Some(step) => step.clone(),
            None => return,
        };

        let mut outputs = step.outputs.clone();
        outputs.sort();

        for pattern in outputs.iter()
        {
            let formatted = match substitute(&self.bindings, pattern)
            {
                Ok(formatted) => formatted,
                Err(_) => continue,
            };
            let mut formatted = formatted;
            formatted.optional = true;

            if formatted.phony
            {
                self.session.poison(&formatted);
                continue;
            }

            let paths = match glob_paths(&self.session.stat, &[formatted])
            {
                Ok(paths) => paths,
                Err(_) => continue,
            };
            for path in paths
            {
                self.session.poison(&path);
                if self.session.options.remove_failed_outputs && ! path.precious
                {
                    self.log(LogLevel::File, &format!(
                        "Remove the failed output: {}", path));
                    self.remove_output(&path);
                }
            }
        }
    }

    /*  The ordered freshness decision for the next action. */
    fn should_run_action(&self) -> bool
    {
        let state = self.state.borrow();

        if state.must_run_action
        {
            return true;
        }

        if let Some(phony_output) = state.phony_outputs.first()
        {
            self.log(LogLevel::Why, &format!(
                "Must run actions to satisfy the phony output: {}", phony_output));
            return true;
        }

        if let Some(missing_output) = &state.missing_output
        {
            self.log(LogLevel::Why, &format!(
                "Must run actions to create the missing output(s): {}",
                missing_output));
            return true;
        }

        if let Some(abandoned_output) = &state.abandoned_output
        {
            self.log(LogLevel::Why, &format!(
                "Must run actions since it has changed to abandon the output: {}",
                abandoned_output));
            return true;
        }

        if ! state.new_persistent_actions.is_empty()
        {
            /*  Compare against the same position in the last successful
                run's action list. */
            let index = state.new_persistent_actions.len() - 1;
            if index >= state.old_persistent_actions.len()
            {
                self.log(LogLevel::Why,
                    "Must run actions since it has changed to add action(s)");
                return true;
            }
            if self.different_actions(
                &state.old_persistent_actions[index],
                &state.new_persistent_actions[index])
            {
                return true;
            }
        }

        /*  All output files exist.  With no inputs at all this is a pure
            computation that is as done as it will ever be. */
        if state.newest_input_path.is_none()
        {
            self.log(LogLevel::Debug,
                "Can skip actions because all the outputs exist \
                 and there are no newer inputs");
            return false;
        }

        if state.oldest_output_path.is_some()
            && state.oldest_output_mtime_ns <= state.newest_input_mtime_ns
        {
            self.log(LogLevel::Why, &format!(
                "Must run actions because the output: {} \
                 is not newer than the input: {}",
                state.oldest_output_path.as_deref().unwrap_or(""),
                state.newest_input_path.as_deref().unwrap_or("")));
            return true;
        }

        self.log(LogLevel::Debug,
            "Can skip actions because all the outputs exist \
             and are newer than all the inputs");
        false
    }

    fn different_actions(
        &self,
        old_action : &PersistentAction,
        new_action : &PersistentAction) -> bool
    {
        if self.different_required(old_action, new_action)
        {
            return true;
        }

        if old_action.command != new_action.command
        {
            let describe = |command : &Option<Vec<String>>| match command
            {
                Some(words) => format!("the command: {}", words.join(" ")),
                None => "a phony command".to_string(),
            };

            self.log(LogLevel::Why, &format!(
                "Must run actions because it has changed {} into {}",
                describe(&old_action.command), describe(&new_action.command)));
            return true;
        }

        false
    }

    /*  Each way the required set can differ gets its own reason line: a path
        added, a path dropped, a producer change, a time change. */
    fn different_required(
        &self,
        old_action : &PersistentAction,
        new_action : &PersistentAction) -> bool
    {
        for new_path in new_action.required.keys()
        {
            if ! old_action.required.contains_key(new_path)
            {
                self.log(LogLevel::Why, &format!(
                    "Must run actions because it has changed to require: {}",
                    new_path));
                return true;
            }
        }

        for old_path in old_action.required.keys()
        {
            if ! new_action.required.contains_key(old_path)
            {
                self.log(LogLevel::Why, &format!(
                    "Must run actions because it has changed to not require: {}",
                    old_path));
                return true;
            }
        }

        for (path, new_up_to_date) in new_action.required.iter()
        {
            let old_up_to_date = match old_action.required.get(path)
            {
                Some(old_up_to_date) => old_up_to_date,
                None => continue,
            };

            if old_up_to_date.producer != new_up_to_date.producer
            {
                let describe = |producer : &str|
                if producer.is_empty()
                {
                    "source file".to_string()
                }
                else
                {
                    producer.to_string()
                };

                self.log(LogLevel::Why, &format!(
                    "Must run actions because the producer of the required: {} \
                     has changed from: {} into: {}",
                    path,
                    describe(&old_up_to_date.producer),
                    describe(&new_up_to_date.producer)));
                return true;
            }

            let is_exists_only = self.state.borrow().required.iter()
                .any(|required| required.as_str() == path && required.exists_only);
            if ! is_exists_only && old_up_to_date.mtime_ns != new_up_to_date.mtime_ns
            {
                self.log(LogLevel::Why, &format!(
                    "Must run actions because the modification time of \
                     the required: {} has changed from: {} into: {}",
                    path,
                    nanoseconds_to_string(old_up_to_date.mtime_ns),
                    nanoseconds_to_string(new_up_to_date.mtime_ns)));
                return true;
            }
        }

        false
    }

    /*  Issue one external command, the full envelope: await requires, decide
        freshness, gate on resources, clear stale outputs, spawn, record. */
    pub async fn run_action(
        &self,
        kind : ActionKind,
        command : Vec<AnnotatedStr>,
        options : ActionOptions) -> StepResult<()>
    {
        self.sync().await?;

        let mut run_parts : Vec<AnnotatedStr> = vec![];
        let mut persistent_parts : Vec<String> = vec![];
        let mut log_parts : Vec<String> = vec![];
        let mut is_silent = None;

        for part in command
        {
            let mut part = part;
            if is_silent.is_none()
            {
                if part.as_str().starts_with('@')
                {
                    is_silent = Some(true);
                    if part.as_str() == "@"
                    {
                        continue;
                    }
                    part = part.with_text(part.as_str()[1..].to_string());
                }
                else
                {
                    is_silent = Some(false);
                }
            }

            if ! part.phony
            {
                persistent_parts.push(part.as_str().to_string());
            }

            let log_part =
            if kind == ActionKind::Shell
            {
                part.clone()
            }
            else
            {
                part.with_text(shell_quote(part.as_str()))
            };
            log_parts.push(colored(&log_part));
            run_parts.push(part);
        }

        let is_silent = is_silent.unwrap_or(false);
        let log_command = log_parts.join(" ");

        if let Some(failure) = self.exception()
        {
            self.log(LogLevel::Debug, &format!("Can't run: {}", log_command));
            return Err(StepError::Failed(failure));
        }

        if self.tracking()
        {
            let start_ns = self.session.stat.system().now_ns();
            self.with_last_persistent_action(
                |action| action.run_action(persistent_parts.clone(), start_ns));
        }

        if ! self.should_run_action()
        {
            if self.session.options.log_skipped_actions && ! is_silent
            {
                self.log(LogLevel::Info, &format!("Skip: {}", log_command));
            }
            else
            {
                self.log(LogLevel::Debug, &format!("Skip: {}", log_command));
            }
            {
                let mut state = self.state.borrow_mut();
                state.did_skip_actions = true;
                if ! state.new_persistent_actions.is_empty()
                {
                    state.new_persistent_actions.push(PersistentAction::new());
                }
            }
            self.session.count_skipped();
            return Ok(());
        }

        if self.state.borrow().did_skip_actions
        {
            self.state.borrow_mut().must_run_action = true;
            return Err(StepError::Restart);
        }

        {
            let mut state = self.state.borrow_mut();
            state.must_run_action = true;
            state.did_run_actions = true;
        }
        self.session.count_action();

        let amounts = match self.session.resources.effective(&options.resources)
        {
            Ok(amounts) => amounts,
            Err(error) => return Err(self.hard_abort(format!(
                "{} - {}", self.log_label, error))),
        };

        if ! amounts.is_empty()
        {
            self.use_resources(&amounts).await;
        }

        let result = self.execute_command(
            kind, run_parts, options, is_silent, &log_command).await;

        if ! amounts.is_empty()
        {
            if self.log_enabled(LogLevel::Debug)
            {
                self.log(LogLevel::Debug, &format!(
                    "Free resources: {}", amounts_to_string(&amounts)));
            }
            self.session.resources.free(&amounts);
            if self.log_enabled(LogLevel::Debug)
            {
                self.log(LogLevel::Debug, &format!(
                    "Available resources: {}",
                    self.session.resources.describe_available()));
            }
        }

        result
    }

    async fn use_resources(&self, amounts : &Amounts)
    {
        if self.log_enabled(LogLevel::Debug)
        {
            self.log(LogLevel::Debug, &format!(
                "Paused by waiting for resources: {}", amounts_to_string(amounts)));
        }

        self.session.resources.use_resources(amounts).await;

        if self.log_enabled(LogLevel::Debug)
        {
            self.log(LogLevel::Debug, &format!(
                "Grab resources: {}", amounts_to_string(amounts)));
            self.log(LogLevel::Debug, &format!(
                "Available resources: {}",
                self.session.resources.describe_available()));
        }
    }

    async fn execute_command(
        &self,
        kind : ActionKind,
        run_parts : Vec<AnnotatedStr>,
        options : ActionOptions,
        is_silent : bool,
        log_command : &str) -> StepResult<()>
    {
        self.remove_stale_outputs();

        {
            let mut state = self.state.borrow_mut();
            state.oldest_output_path = None;
            state.oldest_output_mtime_ns = 0;
        }

        if is_silent
        {
            self.log(LogLevel::Debug, &format!("Run: {}", log_command));
        }
        else
        {
            self.log(LogLevel::Info, &format!("Run: {}", log_command));
        }

        let prefix = match kind
        {
            ActionKind::Shell => match options.prefix
            {
                Some(prefix) => Some(prefix),
                None => Some(self.session.options.default_shell_prefix.clone()),
            },
            ActionKind::Spawn => None,
        };

        let exit_status = self.session.runner.run(
            kind,
            prefix,
            run_parts.iter().map(|part| part.as_str().to_string()).collect()).await;

        if self.tracking()
        {
            let end_ns = self.session.stat.system().now_ns();
            self.with_last_persistent_action(
                |action| action.done_action(end_ns));
            self.state.borrow_mut().new_persistent_actions
                .push(PersistentAction::new());
        }

        match exit_status
        {
            Ok(exit_status) =>
            {
                if exit_status != 0 && ! options.ignore_exit_status
                {
                    return self.log_and_abort(format!(
                        "{} - Failure: {}", self.log_label, log_command));
                }
                self.log(LogLevel::Trace, &format!("Success: {}", log_command));
                Ok(())
            },
            Err(error) =>
            {
                self.log_and_abort(format!(
                    "{} - Failed to execute: {}: {}",
                    self.log_label, log_command, error))
            },
        }
    }

    /*  Await every child invocation queued by require so far, then fold
        their outcomes into this invocation: failed inputs poison, healthy
        inputs advance the newest-input clock and fill in the recorded
        modification times. */
    pub async fn sync(&self) -> StepResult<()>
    {
        let handles : Vec<JoinHandle<Option<StepFailure>>> =
        {
            let mut state = self.state.borrow_mut();
            state.async_actions.drain(..).collect()
        };

        if ! handles.is_empty()
        {
            self.log(LogLevel::Debug, "Sync");
            let results = join_all(handles).await;
            let mut state = self.state.borrow_mut();
            for result in results
            {
                match result
                {
                    Ok(Some(failure)) =>
                    {
                        if state.exception.is_none()
                        {
                            state.exception = Some(failure);
                        }
                    },
                    Ok(None) => {},
                    Err(join_error) =>
                    {
                        if state.exception.is_none()
                        {
                            state.exception = Some(StepFailure::new(format!(
                                "{} - A spawned step died: {}",
                                self.log_label, join_error)));
                        }
                    },
                }
            }
        }

        self.log(LogLevel::Debug, "Synced");

        let mut required = self.state.borrow().required.clone();
        required.sort();

        let mut failed_inputs = false;
        for path in required
        {
            let up_to_date = self.session.up_to_date(&path);

            if self.session.is_poisoned(&path)
                || (! path.optional && up_to_date.is_none())
            {
                let level =
                if self.exception().is_none()
                {
                    LogLevel::Error
                }
                else
                {
                    LogLevel::Debug
                };
                self.session.logger.log(level, &format!(
                    "{} - The required: {} has failed to build",
                    self.log_label, path));
                self.session.poison(&path);
                failed_inputs = true;
                continue;
            }

            let up_to_date = match up_to_date
            {
                Some(up_to_date) => up_to_date,

                /*  Absent but optional. */
                None => continue,
            };

            self.log(LogLevel::Debug, &format!("Has the required: {}", path));

            if path.exists_only
            {
                continue;
            }

            let mtime_ns =
            if self.session.is_phony(&path)
            {
                up_to_date.mtime_ns
            }
            else
            {
                match self.session.stat.stat(&path)
                {
                    Ok(file_stat) => file_stat.mtime_ns,
                    Err(error) => return self.log_and_abort(format!(
                        "{} - The required: {} is not accessible: {}",
                        self.log_label, path, error)),
                }
            };

            let mut state = self.state.borrow_mut();
            if state.newest_input_path.is_none()
                || state.newest_input_mtime_ns < mtime_ns
            {
                state.newest_input_path = Some(path.as_str().to_string());
                state.newest_input_mtime_ns = mtime_ns;
            }
        }

        if failed_inputs
        {
            return self.abort(format!(
                "{} - Failed to build the required target(s)", self.log_label));
        }

        /*  Now that everything required is final, backfill the recorded
            modification times for the persisted comparison. */
        {
            let session = &self.session;
            let mut state = self.state.borrow_mut();
            for action in state.new_persistent_actions.iter_mut()
            {
                for (path, partial) in action.required.iter_mut()
                {
                    partial.mtime_ns = match session.up_to_date(path)
                    {
                        Some(full) => full.mtime_ns,
                        None => 0,
                    };
                }
            }
        }

        if self.log_enabled(LogLevel::Debug)
        {
            let state = self.state.borrow();
            match &state.newest_input_path
            {
                None => self.log(LogLevel::Debug, "No inputs"),
                Some(newest) => self.log(LogLevel::Debug, &format!(
                    "Newest input: {} time: {}",
                    newest, nanoseconds_to_string(state.newest_input_mtime_ns))),
            }
        }

        Ok(())
    }
}

/*  The handle a step handler works through: requiring inputs, expanding
    templates with the step's own bindings, and issuing actions. */
pub struct Context<S : System>
{
    pub(crate) invocation : Rc<Invocation<S>>,
}

impl<S : System + 'static> Context<S>
{
    /*  Require a target; queues the producing step without suspending. */
    pub fn require<P : Into<AnnotatedStr>>(&self, path : P) -> StepResult<()>
    {
        self.invocation.clone().require(path.into())
    }

    /*  Expand a template with the step's bindings, then require it. */
    pub fn erequire<P : Into<AnnotatedStr>>(&self, template : P) -> StepResult<()>
    {
        let path = self.expand(template)?;
        self.invocation.clone().require(path)
    }

    /*  Wait for every target required so far.  Returns the first failure
        if any required target could not be built. */
    pub async fn sync(&self) -> StepResult<()>
    {
        self.invocation.sync().await?;
        match self.invocation.exception()
        {
            Some(failure) => Err(StepError::Failed(failure)),
            None => Ok(()),
        }
    }

    /*  Execute a shell command, pipelines and all.  The caller is
        responsible for quoting.  A leading '@' makes the action silent. */
    pub async fn shell(&self, command : Vec<AnnotatedStr>) -> StepResult<()>
    {
        self.invocation.run_action(
            ActionKind::Shell, command, ActionOptions::default()).await
    }

    pub async fn shell_with(
        &self,
        command : Vec<AnnotatedStr>,
        options : ActionOptions) -> StepResult<()>
    {
        self.invocation.run_action(ActionKind::Shell, command, options).await
    }

    /*  Execute an external program directly, without a shell. */
    pub async fn spawn(&self, command : Vec<AnnotatedStr>) -> StepResult<()>
    {
        self.invocation.run_action(
            ActionKind::Spawn, command, ActionOptions::default()).await
    }

    pub async fn spawn_with(
        &self,
        command : Vec<AnnotatedStr>,
        options : ActionOptions) -> StepResult<()>
    {
        self.invocation.run_action(ActionKind::Spawn, command, options).await
    }

    /*  Expand each template, then execute the shell command. */
    pub async fn eshell(&self, templates : Vec<AnnotatedStr>) -> StepResult<()>
    {
        let command = self.expand_all(templates)?;
        self.shell(command).await
    }

    /*  Expand each template, then execute the program. */
    pub async fn espawn(&self, templates : Vec<AnnotatedStr>) -> StepResult<()>
    {
        let command = self.expand_all(templates)?;
        self.spawn(command).await
    }

    /*  Expand the named slots of a template with the step's bindings. */
    pub fn expand<P : Into<AnnotatedStr>>(&self, template : P) -> StepResult<AnnotatedStr>
    {
        match format_template(&self.invocation.bindings, &template.into())
        {
            Ok(expanded) => Ok(expanded),
            Err(error) => Err(self.invocation.pattern_abort(error)),
        }
    }

    fn expand_all(&self, templates : Vec<AnnotatedStr>)
        -> StepResult<Vec<AnnotatedStr>>
    {
        let mut expanded = vec![];
        for template in templates
        {
            expanded.push(self.expand(template)?);
        }
        Ok(expanded)
    }

    /*  The wildcard values captured from the output the step was invoked to
        build. */
    pub fn bindings(&self) -> Bindings
    {
        self.invocation.bindings.clone()
    }

    pub fn binding(&self, name : &str) -> Option<String>
    {
        self.invocation.bindings.get(name).cloned()
    }

    /*  Glob capture patterns (expanded with the step's bindings first)
        against the filesystem. */
    pub fn eglob_capture(&self, patterns : Vec<AnnotatedStr>)
        -> StepResult<Captured>
    {
        let mut substituted = vec![];
        for pattern in patterns
        {
            match substitute(&self.invocation.bindings, &pattern)
            {
                Ok(pattern) => substituted.push(pattern),
                Err(error) => return Err(self.invocation.pattern_abort(error)),
            }
        }
        match glob_capture(&self.invocation.session.stat, &substituted)
        {
            Ok(captured) => Ok(captured),
            Err(error) => Err(self.invocation.hard_abort(format!(
                "{} - {}", self.invocation.log_label, error))),
        }
    }

    pub fn eglob_paths(&self, patterns : Vec<AnnotatedStr>)
        -> StepResult<Vec<AnnotatedStr>>
    {
        Ok(self.eglob_capture(patterns)?.paths)
    }

    pub fn eglob_extract(&self, patterns : Vec<AnnotatedStr>)
        -> StepResult<Vec<Bindings>>
    {
        Ok(self.eglob_capture(patterns)?.bindings)
    }

    /*  For each path matching the pattern, format each template with the
        captured wildcards. */
    pub fn eglob_fmt(
        &self,
        pattern : AnnotatedStr,
        templates : Vec<AnnotatedStr>) -> StepResult<Vec<AnnotatedStr>>
    {
        let mut results = vec![];
        for bindings in self.eglob_extract(vec![pattern])?
        {
            for template in templates.iter()
            {
                match format_template(&bindings, template)
                {
                    Ok(formatted) => results.push(formatted),
                    Err(error) => return Err(self.invocation.pattern_abort(error)),
                }
            }
        }
        Ok(results)
    }

    /*  Fail the step with an explicit reason. */
    pub fn abort(&self, reason : &str) -> StepResult<()>
    {
        self.invocation.log_and_abort(format!(
            "{} - {}", self.invocation.log_label, reason))?;
        match self.invocation.exception()
        {
            Some(failure) => Err(StepError::Failed(failure)),
            None => Ok(()),
        }
    }

    /*  The label log lines of this step carry. */
    pub fn log_prefix(&self) -> String
    {
        self.invocation.log_label.clone()
    }
}
