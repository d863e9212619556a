use crate::system::SystemError;

use futures::future::LocalBoxFuture;
use std::process::Stdio;
use tokio::process::Command;

/*  How an action's words become a child process. */
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ActionKind
{
    /*  Words are joined and interpreted by a shell, pipelines and all.
        Quoting is the caller's responsibility. */
    Shell,

    /*  Words are the argv of a direct program execution. */
    Spawn,
}

/*  Spawns an action's subprocess and waits for its exit status.  The OS
    runner drives real child processes; the fake one interprets a small
    command vocabulary against the in-memory filesystem so the engine can be
    exercised in tests. */
pub trait CommandRunner
{
    fn run(
        &self,
        kind : ActionKind,
        prefix : Option<String>,
        words : Vec<String>) -> LocalBoxFuture<'static, Result<i32, SystemError>>;
}

#[derive(Clone)]
pub struct OsRunner
{
}

impl OsRunner
{
    pub fn new() -> OsRunner
    {
        OsRunner{}
    }
}

impl CommandRunner for OsRunner
{
    fn run(
        &self,
        kind : ActionKind,
        prefix : Option<String>,
        words : Vec<String>) -> LocalBoxFuture<'static, Result<i32, SystemError>>
    {
        Box::pin(async move
        {
            let mut command = match kind
            {
                ActionKind::Shell =>
                {
                    let mut script = String::new();
                    if let Some(prefix) = prefix
                    {
                        script.push_str(&prefix);
                        script.push(' ');
                    }
                    script.push_str(&words.join(" "));

                    let mut command = Command::new("sh");
                    command.arg("-c").arg(script);
                    command
                },

                ActionKind::Spawn =>
                {
                    let mut argv = words.into_iter();
                    let program = match argv.next()
                    {
                        Some(program) => program,
                        None => return Ok(0),
                    };
                    let mut command = Command::new(program);
                    for argument in argv
                    {
                        command.arg(argument);
                    }
                    command
                },
            };

            command.stdin(Stdio::null());
            let mut child = match command.spawn()
            {
                Ok(child) => child,
                Err(error) => return Err(SystemError::Weird(error.to_string())),
            };

            match child.wait().await
            {
                Ok(status) =>
                {
                    match status.code()
                    {
                        Some(code) => Ok(code),

                        /*  Killed by a signal. */
                        None => Ok(-1),
                    }
                },
                Err(error) => Err(SystemError::Weird(error.to_string())),
            }
        })
    }
}

/*  Quote one word the way a careful person would type it at a shell, for
    logging spawn commands faithfully. */
pub fn shell_quote(word : &str) -> String
{
    if ! word.is_empty()
        && word.chars().all(
            |c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c))
    {
        return word.to_string();
    }

    format!("'{}'", word.replace('\'', "'\\''"))
}

#[cfg(test)]
pub mod fake
{
    use crate::runner::
    {
        ActionKind,
        CommandRunner,
    };
    use crate::system::fake::FakeSystem;
    use crate::system::
    {
        read_file_to_string,
        System,
        SystemError,
    };

    use futures::future::LocalBoxFuture;
    use std::cell::RefCell;
    use std::rc::Rc;

    /*  Interprets a small command vocabulary against the fake filesystem:

        touch PATH...            create or freshen files
        mycat SOURCE... TARGET   concatenate sources into the target
        echo WORD...             succeed without touching anything
        true / false / error     fixed exit statuses

        Every executed command is recorded for assertions. */
    #[derive(Clone)]
    pub struct FakeRunner
    {
        system : FakeSystem,
        executed : Rc<RefCell<Vec<Vec<String>>>>,
    }

    impl FakeRunner
    {
        pub fn new(system : FakeSystem) -> FakeRunner
        {
            FakeRunner
            {
                system : system,
                executed : Rc::new(RefCell::new(vec![])),
            }
        }

        pub fn executed(&self) -> Vec<Vec<String>>
        {
            self.executed.borrow().clone()
        }

        fn interpret(&self, words : &[String]) -> Result<i32, SystemError>
        {
            let n = words.len();
            if n == 0
            {
                return Ok(0);
            }

            match words[0].as_str()
            {
                "touch" =>
                {
                    for path in words[1..].iter()
                    {
                        if self.system.is_file(path)
                        {
                            self.system.touch(path)?;
                        }
                        else
                        {
                            self.system.write_file(path, b"")?;
                        }
                    }
                    Ok(0)
                },

                "mycat" =>
                {
                    if n < 2
                    {
                        return Err(SystemError::Weird(
                            "mycat needs a target".to_string()));
                    }
                    let mut output = String::new();
                    for path in words[1..(n - 1)].iter()
                    {
                        output.push_str(&read_file_to_string(&self.system, path)?);
                    }
                    self.system.write_file(&words[n - 1], output.as_bytes())?;
                    Ok(0)
                },

                "echo" | "true" => Ok(0),

                "false" | "error" => Ok(1),

                other => Err(SystemError::Weird(
                    format!("Non command given: {}", other))),
            }
        }
    }

    impl CommandRunner for FakeRunner
    {
        fn run(
            &self,
            kind : ActionKind,
            _prefix : Option<String>,
            words : Vec<String>) -> LocalBoxFuture<'static, Result<i32, SystemError>>
        {
            let runner = self.clone();
            Box::pin(async move
            {
                /*  A real subprocess suspends the invocation at least once;
                    yielding here keeps the concurrency honest in tests. */
                tokio::task::yield_now().await;

                /*  Shell actions arrive as words too; the fake just splits
                    on whitespace the way a trivial shell would. */
                let words = match kind
                {
                    ActionKind::Shell => words
                        .join(" ")
                        .split_whitespace()
                        .map(str::to_string)
                        .collect(),
                    ActionKind::Spawn => words,
                };

                runner.executed.borrow_mut().push(words.clone());
                runner.interpret(&words)
            })
        }
    }
}
