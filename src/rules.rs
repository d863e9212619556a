use crate::annotated::AnnotatedStr;
use crate::invocation::
{
    Context,
    StepResult,
};
use crate::patterns::
{
    Bindings,
    capture_regex,
    clean_path,
    PatternError,
};
use crate::system::System;

use futures::future::LocalBoxFuture;
use percent_encoding::
{
    utf8_percent_encode,
    NON_ALPHANUMERIC,
};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

pub type Handler<S> = Rc<dyn Fn(Context<S>) -> LocalBoxFuture<'static, StepResult<()>>>;

/*  A build step: a handler that knows how to produce the outputs its capture
    patterns describe.  The priority picks between steps claiming the same
    output, letting a specific high-priority step override a generic one. */
pub struct Step<S : System>
{
    pub name : String,
    pub outputs : Vec<AnnotatedStr>,
    pub priority : i32,
    pub handler : Handler<S>,
}

#[derive(Debug, PartialEq)]
pub enum RegisterError
{
    LateRegistration(String),
    ConflictingDefinitions(String),
    NoOutputs(String),
    Pattern(PatternError),
}

impl fmt::Display for RegisterError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            RegisterError::LateRegistration(name) =>
                write!(formatter, "Late registration of the step: {}", name),

            RegisterError::ConflictingDefinitions(name) =>
                write!(formatter, "Conflicting definitions for the step: {}", name),

            RegisterError::NoOutputs(name) =>
                write!(formatter, "The step: {} specifies no output", name),

            RegisterError::Pattern(error) =>
                write!(formatter, "{}", error),
        }
    }
}

impl From<PatternError> for RegisterError
{
    fn from(error : PatternError) -> RegisterError
    {
        RegisterError::Pattern(error)
    }
}

#[derive(Debug, PartialEq)]
pub enum ResolveError
{
    AmbiguousProducers
    {
        path : String,
        first_name : String,
        second_name : String,
        priority : i32,
    },
}

impl fmt::Display for ResolveError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            ResolveError::AmbiguousProducers{path, first_name, second_name, priority} =>
                write!(formatter, "the output: {} may be created by both the step: {} \
                    and the step: {} at the same priority: {}",
                    path, first_name, second_name, priority),
        }
    }
}

/*  The registered steps, resolvable from a requested path once frozen. */
pub struct StepRegistry<S : System>
{
    by_name : BTreeMap<String, Rc<Step<S>>>,
    by_regexp : Vec<(Regex, Rc<Step<S>>)>,
    is_finalized : bool,
}

impl<S : System> StepRegistry<S>
{
    pub fn new() -> StepRegistry<S>
    {
        StepRegistry
        {
            by_name : BTreeMap::new(),
            by_regexp : vec![],
            is_finalized : false,
        }
    }

    /*  Register a step.  Output patterns are normalized and their matchers
        compiled up front so pattern errors surface at registration, with
        their position. */
    pub fn step<F, Fut>(
        &mut self,
        name : &str,
        outputs : Vec<AnnotatedStr>,
        priority : i32,
        handler : F) -> Result<(), RegisterError>
    where
        F : Fn(Context<S>) -> Fut + 'static,
        Fut : Future<Output = StepResult<()>> + 'static,
    {
        if self.is_finalized
        {
            return Err(RegisterError::LateRegistration(name.to_string()));
        }

        if self.by_name.contains_key(name)
        {
            return Err(RegisterError::ConflictingDefinitions(name.to_string()));
        }

        if outputs.is_empty()
        {
            return Err(RegisterError::NoOutputs(name.to_string()));
        }

        let mut cleaned_outputs = vec![];
        let mut regexes = vec![];
        for output in outputs
        {
            let output = clean_path(&output);
            regexes.push(capture_regex(output.as_str())?);
            cleaned_outputs.push(output);
        }

        let boxed : Handler<S> = Rc::new(move |context| Box::pin(handler(context)));
        let step = Rc::new(Step
        {
            name : name.to_string(),
            outputs : cleaned_outputs,
            priority : priority,
            handler : boxed,
        });

        for regex in regexes
        {
            self.by_regexp.push((regex, step.clone()));
        }
        self.by_name.insert(name.to_string(), step);
        Ok(())
    }

    /*  No more registrations once the driver starts resolving. */
    pub fn finalize(&mut self)
    {
        self.is_finalized = true;
    }

    pub fn get(&self, name : &str) -> Option<&Rc<Step<S>>>
    {
        self.by_name.get(name)
    }

    /*  Find the unique step, if any, that produces the path, together with
        the wildcard bindings deduced from the path.  Ties at the winning
        priority are a hard error rather than an arbitrary pick. */
    pub fn resolve(&self, path : &str)
        -> Result<Option<(Rc<Step<S>>, Bindings)>, ResolveError>
    {
        let mut producers : Vec<(i32, &str, &Regex, &Rc<Step<S>>)> = vec![];

        for (regex, step) in self.by_regexp.iter()
        {
            if regex.is_match(path)
            {
                producers.push((-step.priority, &step.name, regex, step));
            }
        }

        producers.sort_by(|left, right| (left.0, left.1).cmp(&(right.0, right.1)));

        if producers.len() > 1 && producers[0].0 == producers[1].0
        {
            return Err(ResolveError::AmbiguousProducers
            {
                path : path.to_string(),
                first_name : producers[0].1.to_string(),
                second_name : producers[1].1.to_string(),
                priority : -producers[0].0,
            });
        }

        match producers.first()
        {
            Some((_, _, regex, step)) =>
            {
                let bindings = extract_bindings(regex, path);
                Ok(Some(((*step).clone(), bindings)))
            },
            None => Ok(None),
        }
    }

    /*  Render the registered steps and their outputs, for --list-steps. */
    pub fn list_steps(&self) -> String
    {
        let mut steps : Vec<(i32, &String, &Rc<Step<S>>)> = self.by_name
            .iter()
            .map(|(name, step)| (step.priority, name, step))
            .collect();
        steps.sort_by(|left, right| (left.0, left.1).cmp(&(right.0, right.1)));

        let mut lines = vec![];
        for (_, name, step) in steps
        {
            if ! lines.is_empty()
            {
                lines.push(String::new());
            }
            lines.push(format!("{}:", name));
            lines.push(format!("  priority: {}", step.priority));
            lines.push("  outputs:".to_string());

            let mut outputs = step.outputs.clone();
            outputs.sort();
            for output in outputs
            {
                let mut properties = vec![];
                if output.exists_only
                {
                    properties.push("exists");
                }
                if output.optional
                {
                    properties.push("optional");
                }
                if output.phony
                {
                    properties.push("phony");
                }
                if output.precious
                {
                    properties.push("precious");
                }

                if properties.is_empty()
                {
                    lines.push(format!("  - {}", output));
                }
                else
                {
                    lines.push(format!("  - {}: {}", output, properties.join(", ")));
                }
            }
        }
        lines.join("\n")
    }
}

fn extract_bindings(regex : &Regex, path : &str) -> Bindings
{
    let mut bindings = Bindings::new();
    let captures = match regex.captures(path)
    {
        Some(captures) => captures,
        None => return bindings,
    };

    for name in regex.capture_names()
    {
        if let Some(name) = name
        {
            if name.starts_with('_')
            {
                continue;
            }
            let value = match captures.name(name)
            {
                Some(found) => found.as_str().to_string(),
                None => String::new(),
            };
            bindings.insert(name.to_string(), value);
        }
    }
    bindings
}

/*  The identity of an invocation: the step name, plus the sorted escaped
    bindings when there are any. */
pub fn canonical_name(step_name : &str, bindings : &Bindings) -> String
{
    if bindings.is_empty()
    {
        return step_name.to_string();
    }

    let encoded : Vec<String> = bindings
        .iter()
        .map(|(name, value)| format!(
            "{}={}",
            utf8_percent_encode(name, NON_ALPHANUMERIC),
            utf8_percent_encode(value, NON_ALPHANUMERIC)))
        .collect();

    format!("{}/{}", step_name, encoded.join(","))
}
