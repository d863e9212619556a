use crate::logger::LogLevel;
use crate::system::
{
    read_file_to_string,
    System,
    SystemError,
};

use std::collections::BTreeMap;
use std::fmt;

/*  The value of a build parameter. */
#[derive(Clone, Debug, PartialEq)]
pub enum ParamValue
{
    Bool(bool),
    Int(i64),
    Str(String),
}

impl fmt::Display for ParamValue
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            ParamValue::Bool(value) => write!(formatter, "{}", value),
            ParamValue::Int(value) => write!(formatter, "{}", value),
            ParamValue::Str(value) => write!(formatter, "{}", value),
        }
    }
}

/*  How to interpret the textual spelling of a parameter. */
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParamKind
{
    Bool,
    Int,
    Str,
}

#[derive(Debug, PartialEq)]
pub enum ParamError
{
    MultipleDefinitions(String),
    UnknownParameter
    {
        name : String,
        source : String,
    },
    InvalidValue
    {
        name : String,
        value : String,
        source : String,
    },
    ConfigFailedToRead(String, SystemError),
    ConfigFailedToParse(String, String),
    ConfigNotAMapping(String),
    InvalidLogLevel(String),
}

impl fmt::Display for ParamError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            ParamError::MultipleDefinitions(name) =>
                write!(formatter, "Multiple definitions for the parameter: {}", name),

            ParamError::UnknownParameter{name, source} =>
                write!(formatter, "Unknown parameter: {} specified in: {}", name, source),

            ParamError::InvalidValue{name, value, source} =>
                write!(formatter, "Invalid value: {} for the parameter: {} specified in: {}",
                    value, name, source),

            ParamError::ConfigFailedToRead(path, error) =>
                write!(formatter, "Configuration file did not open: {}\n{}", path, error),

            ParamError::ConfigFailedToParse(path, error) =>
                write!(formatter, "Configuration file failed to parse: {}\n{}", path, error),

            ParamError::ConfigNotAMapping(path) =>
                write!(formatter, "The configuration file: {} does not contain a top-level mapping",
                    path),

            ParamError::InvalidLogLevel(value) =>
                write!(formatter, "Unknown log level: {}", value),
        }
    }
}

/*  One configurable build knob: a name, a type, a default, and the help text
    for the command line. */
#[derive(Clone, Debug)]
pub struct Parameter
{
    pub name : String,
    pub short : Option<char>,
    pub kind : ParamKind,
    pub default : ParamValue,
    pub description : String,
    pub metavar : String,
}

impl Parameter
{
    pub fn new(
        name : &str,
        short : Option<char>,
        default : ParamValue,
        description : &str) -> Parameter
    {
        let (kind, metavar) = match &default
        {
            ParamValue::Bool(_) => (ParamKind::Bool, "BOOL"),
            ParamValue::Int(_) => (ParamKind::Int, "INT"),
            ParamValue::Str(_) => (ParamKind::Str, "STR"),
        };

        Parameter
        {
            name : name.to_string(),
            short : short,
            kind : kind,
            default : default,
            description : description.to_string(),
            metavar : metavar.to_string(),
        }
    }

    fn parse(&self, text : &str, source : &str) -> Result<ParamValue, ParamError>
    {
        let invalid = || ParamError::InvalidValue
        {
            name : self.name.clone(),
            value : text.to_string(),
            source : source.to_string(),
        };

        match self.kind
        {
            ParamKind::Bool =>
            {
                match text.to_ascii_lowercase().as_str()
                {
                    "yes" | "true" | "t" | "y" | "1" => Ok(ParamValue::Bool(true)),
                    "no" | "false" | "f" | "n" | "0" => Ok(ParamValue::Bool(false)),
                    _ => Err(invalid()),
                }
            },

            ParamKind::Int =>
            {
                match text.parse::<i64>()
                {
                    Ok(value) => Ok(ParamValue::Int(value)),
                    Err(_) => Err(invalid()),
                }
            },

            ParamKind::Str => Ok(ParamValue::Str(text.to_string())),
        }
    }
}

/*  The registered parameters and their effective values, after layering the
    defaults, any configuration files, and the command line. */
pub struct ParameterRegistry
{
    by_name : BTreeMap<String, Parameter>,
    values : BTreeMap<String, ParamValue>,
}

impl ParameterRegistry
{
    /*  A registry pre-loaded with the engine's own parameters. */
    pub fn new() -> ParameterRegistry
    {
        let mut registry = ParameterRegistry
        {
            by_name : BTreeMap::new(),
            values : BTreeMap::new(),
        };

        let core = vec![
            Parameter::new("jobs", Some('j'), ParamValue::Int(-1),
                "The number of jobs to run in parallel. Use 0 for unlimited parallelism, \
                 1 for serial job execution, and a negative number for a fraction of the \
                 logical processors in the system"),
            Parameter::new("log_level", None, ParamValue::Str("WARN".to_string()),
                "The log level to use"),
            Parameter::new("log_skipped_actions", None, ParamValue::Bool(false),
                "Whether to log (level INFO) skipped actions"),
            Parameter::new("rebuild_changed_actions", None, ParamValue::Bool(true),
                "Whether to rebuild outputs if the actions have changed"),
            Parameter::new("persistent_directory", None,
                ParamValue::Str(".dynamake".to_string()),
                "The directory to keep persistent data in, if rebuild_changed_actions is true"),
            Parameter::new("failure_aborts_build", None, ParamValue::Bool(true),
                "Whether to stop the build if any action fails"),
            Parameter::new("remove_stale_outputs", None, ParamValue::Bool(true),
                "Whether to remove old output files before executing an action"),
            Parameter::new("touch_success_outputs", None, ParamValue::Bool(false),
                "Whether to touch output files on a successful action to ensure they are \
                 newer than the input file(s)"),
            Parameter::new("remove_failed_outputs", None, ParamValue::Bool(true),
                "Whether to remove output files on a failing action"),
            Parameter::new("remove_empty_directories", None, ParamValue::Bool(false),
                "Whether to remove empty directories when deleting the last file in them"),
            Parameter::new("default_shell_prefix", None,
                ParamValue::Str("set -eou pipefail;".to_string()),
                "Default prefix to add to shell actions"),
        ];

        for parameter in core
        {
            match registry.register(parameter)
            {
                Ok(()) => {},
                Err(_) => {},
            }
        }
        registry
    }

    pub fn register(&mut self, parameter : Parameter) -> Result<(), ParamError>
    {
        if self.by_name.contains_key(&parameter.name)
        {
            return Err(ParamError::MultipleDefinitions(parameter.name));
        }
        self.values.insert(parameter.name.clone(), parameter.default.clone());
        self.by_name.insert(parameter.name.clone(), parameter);
        Ok(())
    }

    pub fn parameters(&self) -> impl Iterator<Item = &Parameter>
    {
        self.by_name.values()
    }

    pub fn get(&self, name : &str) -> Option<&ParamValue>
    {
        self.values.get(name)
    }

    /*  Apply one textual override, as from a command line flag. */
    pub fn set_from_text(&mut self, name : &str, text : &str) -> Result<(), ParamError>
    {
        let parameter = match self.by_name.get(name)
        {
            Some(parameter) => parameter,
            None => return Err(ParamError::UnknownParameter
            {
                name : name.to_string(),
                source : "the command line".to_string(),
            }),
        };

        let value = parameter.parse(text, "the command line")?;
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    /*  Load a configuration file: a top-level YAML mapping of parameter name
        to value.  String values pass through the parameter's parser,
        non-strings must already have the right shape. */
    pub fn load_config<S : System>(&mut self, system : &S, path : &str)
        -> Result<(), ParamError>
    {
        let text = match read_file_to_string(system, path)
        {
            Ok(text) => text,
            Err(error) => return Err(ParamError::ConfigFailedToRead(path.to_string(), error)),
        };

        let document : serde_yaml::Value = match serde_yaml::from_str(&text)
        {
            Ok(document) => document,
            Err(error) =>
                return Err(ParamError::ConfigFailedToParse(path.to_string(), error.to_string())),
        };

        let mapping = match document
        {
            serde_yaml::Value::Null => return Ok(()),
            serde_yaml::Value::Mapping(mapping) => mapping,
            _ => return Err(ParamError::ConfigNotAMapping(path.to_string())),
        };

        for (key, value) in mapping
        {
            let name = match key
            {
                serde_yaml::Value::String(name) => name,
                other => return Err(ParamError::UnknownParameter
                {
                    name : format!("{:?}", other),
                    source : path.to_string(),
                }),
            };

            let parameter = match self.by_name.get(&name)
            {
                Some(parameter) => parameter,
                None => return Err(ParamError::UnknownParameter
                {
                    name : name,
                    source : path.to_string(),
                }),
            };

            let invalid = |value : &serde_yaml::Value| ParamError::InvalidValue
            {
                name : name.clone(),
                value : format!("{:?}", value),
                source : path.to_string(),
            };

            let parsed = match &value
            {
                serde_yaml::Value::String(text) => parameter.parse(text, path)?,
                serde_yaml::Value::Bool(flag) if parameter.kind == ParamKind::Bool =>
                    ParamValue::Bool(*flag),
                serde_yaml::Value::Number(number) if parameter.kind == ParamKind::Int =>
                {
                    match number.as_i64()
                    {
                        Some(int) => ParamValue::Int(int),
                        None => return Err(invalid(&value)),
                    }
                },
                other => return Err(invalid(other)),
            };

            self.values.insert(name, parsed);
        }
        Ok(())
    }

    pub fn bool_value(&self, name : &str) -> Result<bool, ParamError>
    {
        match self.values.get(name)
        {
            Some(ParamValue::Bool(value)) => Ok(*value),
            Some(other) => Err(ParamError::InvalidValue
            {
                name : name.to_string(),
                value : format!("{}", other),
                source : "the registry".to_string(),
            }),
            None => Err(ParamError::UnknownParameter
            {
                name : name.to_string(),
                source : "the registry".to_string(),
            }),
        }
    }

    pub fn int_value(&self, name : &str) -> Result<i64, ParamError>
    {
        match self.values.get(name)
        {
            Some(ParamValue::Int(value)) => Ok(*value),
            Some(other) => Err(ParamError::InvalidValue
            {
                name : name.to_string(),
                value : format!("{}", other),
                source : "the registry".to_string(),
            }),
            None => Err(ParamError::UnknownParameter
            {
                name : name.to_string(),
                source : "the registry".to_string(),
            }),
        }
    }

    pub fn str_value(&self, name : &str) -> Result<String, ParamError>
    {
        match self.values.get(name)
        {
            Some(ParamValue::Str(value)) => Ok(value.clone()),
            Some(other) => Err(ParamError::InvalidValue
            {
                name : name.to_string(),
                value : format!("{}", other),
                source : "the registry".to_string(),
            }),
            None => Err(ParamError::UnknownParameter
            {
                name : name.to_string(),
                source : "the registry".to_string(),
            }),
        }
    }
}

/*  The engine's own parameters, resolved to their final typed values. */
#[derive(Clone, Debug, PartialEq)]
pub struct BuildOptions
{
    pub jobs : i64,
    pub log_level : LogLevel,
    pub log_skipped_actions : bool,
    pub rebuild_changed_actions : bool,
    pub persistent_directory : String,
    pub failure_aborts_build : bool,
    pub remove_stale_outputs : bool,
    pub touch_success_outputs : bool,
    pub remove_failed_outputs : bool,
    pub remove_empty_directories : bool,
    pub default_shell_prefix : String,
}

impl BuildOptions
{
    pub fn from_registry(registry : &ParameterRegistry) -> Result<BuildOptions, ParamError>
    {
        let log_level_name = registry.str_value("log_level")?;
        let log_level = match LogLevel::from_name(&log_level_name)
        {
            Some(level) => level,
            None => return Err(ParamError::InvalidLogLevel(log_level_name)),
        };

        Ok(BuildOptions
        {
            jobs : registry.int_value("jobs")?,
            log_level : log_level,
            log_skipped_actions : registry.bool_value("log_skipped_actions")?,
            rebuild_changed_actions : registry.bool_value("rebuild_changed_actions")?,
            persistent_directory : registry.str_value("persistent_directory")?,
            failure_aborts_build : registry.bool_value("failure_aborts_build")?,
            remove_stale_outputs : registry.bool_value("remove_stale_outputs")?,
            touch_success_outputs : registry.bool_value("touch_success_outputs")?,
            remove_failed_outputs : registry.bool_value("remove_failed_outputs")?,
            remove_empty_directories : registry.bool_value("remove_empty_directories")?,
            default_shell_prefix : registry.str_value("default_shell_prefix")?,
        })
    }
}

impl Default for BuildOptions
{
    fn default() -> BuildOptions
    {
        BuildOptions
        {
            jobs : -1,
            log_level : LogLevel::Warn,
            log_skipped_actions : false,
            rebuild_changed_actions : true,
            persistent_directory : ".dynamake".to_string(),
            failure_aborts_build : true,
            remove_stale_outputs : true,
            touch_success_outputs : false,
            remove_failed_outputs : true,
            remove_empty_directories : false,
            default_shell_prefix : "set -eou pipefail;".to_string(),
        }
    }
}
