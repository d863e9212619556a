use crate::annotated::AnnotatedStr;

use chrono::Local;
use std::io::Write;
use termcolor::
{
    Ansi,
    ColorSpec,
    WriteColor,
};

/*  Levels, ordered.  WHY carries the reasons actions must run, FILE the file
    operations, TRACE the call/done lines of each invocation. */
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel
{
    Debug,
    Trace,
    Why,
    File,
    Info,
    Warn,
    Error,
}

impl LogLevel
{
    pub fn from_name(name : &str) -> Option<LogLevel>
    {
        match name.to_ascii_uppercase().as_str()
        {
            "DEBUG" => Some(LogLevel::Debug),
            "TRACE" => Some(LogLevel::Trace),
            "WHY" => Some(LogLevel::Why),
            "FILE" => Some(LogLevel::File),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str
    {
        match self
        {
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
            LogLevel::Why => "WHY",
            LogLevel::File => "FILE",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

pub trait BuildLogger
{
    fn log(&self, level : LogLevel, message : &str);

    fn enabled(&self, level : LogLevel) -> bool;
}

/*  Writes timestamped lines to stderr. */
pub struct StandardLogger
{
    min_level : LogLevel,
}

impl StandardLogger
{
    pub fn new(min_level : LogLevel) -> StandardLogger
    {
        StandardLogger
        {
            min_level : min_level,
        }
    }
}

impl BuildLogger for StandardLogger
{
    fn log(&self, level : LogLevel, message : &str)
    {
        if level < self.min_level
        {
            return;
        }

        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        eprintln!("{} - dynamake - {} - {}", timestamp, level.name(), message);
    }

    fn enabled(&self, level : LogLevel) -> bool
    {
        level >= self.min_level
    }
}

/*  Render an emphasized command word in bold so it stands out of the text
    soup of a long command line.  Plain words pass through untouched. */
pub fn colored(word : &AnnotatedStr) -> String
{
    if ! word.emphasized
    {
        return word.as_str().to_string();
    }

    let mut ansi = Ansi::new(vec![]);
    let written =
        ansi.set_color(ColorSpec::new().set_bold(true)).is_ok()
        && ansi.write_all(word.as_str().as_bytes()).is_ok()
        && ansi.reset().is_ok();

    if ! written
    {
        return word.as_str().to_string();
    }

    match String::from_utf8(ansi.into_inner())
    {
        Ok(text) => text,
        Err(_) => word.as_str().to_string(),
    }
}

#[cfg(test)]
pub mod capture
{
    use crate::logger::
    {
        BuildLogger,
        LogLevel,
    };
    use std::cell::RefCell;
    use std::rc::Rc;

    /*  Records every line for assertions. */
    #[derive(Clone)]
    pub struct CapturedLogger
    {
        lines : Rc<RefCell<Vec<(LogLevel, String)>>>,
    }

    impl CapturedLogger
    {
        pub fn new() -> CapturedLogger
        {
            CapturedLogger
            {
                lines : Rc::new(RefCell::new(vec![])),
            }
        }

        pub fn lines(&self) -> Vec<(LogLevel, String)>
        {
            self.lines.borrow().clone()
        }

        pub fn contains(&self, level : LogLevel, fragment : &str) -> bool
        {
            self.lines.borrow().iter().any(
                |(line_level, line)| *line_level == level && line.contains(fragment))
        }
    }

    impl BuildLogger for CapturedLogger
    {
        fn log(&self, level : LogLevel, message : &str)
        {
            self.lines.borrow_mut().push((level, message.to_string()));
        }

        fn enabled(&self, _level : LogLevel) -> bool
        {
            true
        }
    }
}

#[cfg(test)]
mod tests
{
    use crate::annotated::
    {
        AnnotatedStr,
        emphasized,
    };
    use crate::logger::
    {
        colored,
        LogLevel,
    };

    #[test]
    fn levels_are_ordered()
    {
        assert!(LogLevel::Debug < LogLevel::Trace);
        assert!(LogLevel::Trace < LogLevel::Why);
        assert!(LogLevel::Why < LogLevel::File);
        assert!(LogLevel::File < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Error);
    }

    #[test]
    fn level_names_round_trip()
    {
        for name in &["DEBUG", "TRACE", "WHY", "FILE", "INFO", "WARN", "ERROR"]
        {
            assert_eq!(LogLevel::from_name(name).unwrap().name(), *name);
        }
        assert_eq!(LogLevel::from_name("warn"), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_name("bogus"), None);
    }

    #[test]
    fn emphasized_words_render_in_bold()
    {
        let word = colored(&emphasized("banana"));
        assert!(word.contains("banana"));
        assert!(word.contains("\u{1b}["));

        let plain = colored(&AnnotatedStr::new("banana"));
        assert_eq!(plain, "banana");
    }
}
