use crate::system::
{
    read_file_to_string,
    System,
    SystemError,
};

use chrono::NaiveDateTime;
use serde::
{
    Deserialize,
    Serialize,
};
use std::collections::BTreeMap;

/*  A target proven current: who produced it and when it was last modified.
    The producer is empty for source files.  A zero mtime means the time is
    not yet known. */
#[derive(Clone, Debug, PartialEq)]
pub struct UpToDate
{
    pub producer : String,
    pub mtime_ns : u64,
}

impl UpToDate
{
    pub fn new(producer : &str, mtime_ns : u64) -> UpToDate
    {
        UpToDate
        {
            producer : producer.to_string(),
            mtime_ns : mtime_ns,
        }
    }

    pub fn source(mtime_ns : u64) -> UpToDate
    {
        UpToDate::new("", mtime_ns)
    }
}

/*  One node of the action list a successful run persisted: the command that
    ran (phony words excluded; absent for command-less bookkeeping), when it
    started and ended, and the up-to-date data of everything required before
    it ran. */
#[derive(Clone, Debug, PartialEq)]
pub struct PersistentAction
{
    pub command : Option<Vec<String>>,
    pub start_ns : Option<u64>,
    pub end_ns : Option<u64>,
    pub required : BTreeMap<String, UpToDate>,
}

impl PersistentAction
{
    pub fn new() -> PersistentAction
    {
        PersistentAction
        {
            command : None,
            start_ns : None,
            end_ns : None,
            required : BTreeMap::new(),
        }
    }

    pub fn require(&mut self, path : &str, up_to_date : UpToDate)
    {
        self.required.insert(path.to_string(), up_to_date);
    }

    pub fn run_action(&mut self, command : Vec<String>, start_ns : u64)
    {
        self.command = Some(command);
        self.start_ns = Some(start_ns);
    }

    pub fn done_action(&mut self, end_ns : u64)
    {
        self.end_ns = Some(end_ns);
    }

    /*  Whether this node carries anything beyond its predecessor. */
    pub fn is_empty(&self) -> bool
    {
        self.command.is_none() && self.required.is_empty()
    }
}

#[derive(Serialize, Deserialize)]
struct UpToDateData
{
    producer : String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    mtime : Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ActionData
{
    required : BTreeMap<String, UpToDateData>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    command : Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    start : Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    end : Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ActionsDocument
{
    actions : Vec<ActionData>,
    outputs : Vec<String>,
}

/*  Serialize nanoseconds since the epoch with full precision, so files
    modified within the same second stay distinguishable. */
pub fn nanoseconds_to_string(nanoseconds : u64) -> String
{
    let seconds = (nanoseconds / 1_000_000_000) as i64;
    let fraction = (nanoseconds % 1_000_000_000) as u32;
    match chrono::DateTime::from_timestamp(seconds, fraction)
    {
        Some(datetime) =>
            datetime.naive_utc().format("%Y-%m-%d %H:%M:%S%.9f").to_string(),
        None => format!("{}.{:09}", seconds, fraction),
    }
}

pub fn nanoseconds_from_string(text : &str) -> Option<u64>
{
    let datetime = match NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
    {
        Ok(datetime) => datetime,
        Err(_) => return None,
    };

    let seconds = datetime.and_utc().timestamp();
    if seconds < 0
    {
        return None;
    }
    Some(seconds as u64 * 1_000_000_000 + u64::from(datetime.and_utc().timestamp_subsec_nanos()))
}

/*  Where the log of one invocation lives.  The canonical name may contain
    slashes, so writes create the intermediate directories. */
pub fn log_path(directory : &str, name : &str) -> String
{
    format!("{}/{}.actions.yaml", directory, name)
}

pub enum LoadResult
{
    /*  No log: the invocation has never succeeded here. */
    Missing,

    /*  Unreadable or malformed: degrade to must-run, never fail the build. */
    Invalid(String),

    Loaded
    {
        actions : Vec<PersistentAction>,
        outputs : Vec<String>,
    },
}

pub fn read<S : System>(system : &S, directory : &str, name : &str) -> LoadResult
{
    let path = log_path(directory, name);

    let text = match read_file_to_string(system, &path)
    {
        Ok(text) => text,
        Err(SystemError::NotFound) => return LoadResult::Missing,
        Err(error) => return LoadResult::Invalid(format!("{}", error)),
    };

    let document : ActionsDocument = match serde_yaml::from_str(&text)
    {
        Ok(document) => document,
        Err(error) => return LoadResult::Invalid(format!("{}", error)),
    };

    let mut actions = vec![];
    for datum in document.actions
    {
        let mut action = PersistentAction::new();
        for (path, data) in datum.required
        {
            let mtime_ns = match data.mtime
            {
                Some(text) => match nanoseconds_from_string(&text)
                {
                    Some(mtime_ns) => mtime_ns,
                    None => return LoadResult::Invalid(
                        format!("invalid modification time: {}", text)),
                },
                None => 0,
            };
            action.require(&path, UpToDate::new(&data.producer, mtime_ns));
        }

        if let Some(command) = datum.command
        {
            let start_ns = datum.start.as_deref().and_then(nanoseconds_from_string);
            let end_ns = datum.end.as_deref().and_then(nanoseconds_from_string);
            match (start_ns, end_ns)
            {
                (Some(start_ns), Some(end_ns)) =>
                {
                    action.command = Some(command);
                    action.start_ns = Some(start_ns);
                    action.end_ns = Some(end_ns);
                },
                _ => return LoadResult::Invalid(
                    "an executed command is missing its timestamps".to_string()),
            }
        }

        actions.push(action);
    }

    if actions.is_empty()
    {
        actions.push(PersistentAction::new());
    }

    LoadResult::Loaded
    {
        actions : actions,
        outputs : document.outputs,
    }
}

/*  Write the log of a successful run.  Only ever called on success, so the
    on-disk state always reflects the last run that worked. */
pub fn write<S : System>(
    system : &S,
    directory : &str,
    name : &str,
    actions : &[PersistentAction],
    outputs : &[String]) -> Result<(), SystemError>
{
    let path = log_path(directory, name);

    if let Some(position) = path.rfind('/')
    {
        system.create_dir_all(&path[..position])?;
    }

    let mut data = vec![];
    for action in actions
    {
        let mut required = BTreeMap::new();
        for (required_path, up_to_date) in action.required.iter()
        {
            let mtime = if up_to_date.mtime_ns > 0
            {
                Some(nanoseconds_to_string(up_to_date.mtime_ns))
            }
            else
            {
                None
            };
            required.insert(required_path.clone(), UpToDateData
            {
                producer : up_to_date.producer.clone(),
                mtime : mtime,
            });
        }

        data.push(ActionData
        {
            required : required,
            command : action.command.clone(),
            start : action.start_ns.map(nanoseconds_to_string),
            end : action.end_ns.map(nanoseconds_to_string),
        });
    }

    let document = ActionsDocument
    {
        actions : data,
        outputs : outputs.to_vec(),
    };

    let text = match serde_yaml::to_string(&document)
    {
        Ok(text) => text,
        Err(error) => return Err(SystemError::Weird(error.to_string())),
    };
    system.write_file(&path, text.as_bytes())
}

/*  Remove the log after a failure, pruning the parent directory when the
    canonical name made one and it is now empty. */
pub fn remove<S : System>(system : &S, directory : &str, name : &str)
{
    let path = log_path(directory, name);

    match system.remove_file(&path)
    {
        Ok(()) => {},
        Err(_) => {},
    }

    if ! name.contains('/')
    {
        return;
    }
    if let Some(position) = path.rfind('/')
    {
        match system.remove_dir(&path[..position])
        {
            Ok(()) => {},
            Err(_) => {},
        }
    }
}

#[cfg(test)]
mod tests
{
    use crate::persist::
    {
        LoadResult,
        log_path,
        nanoseconds_from_string,
        nanoseconds_to_string,
        PersistentAction,
        read,
        remove,
        UpToDate,
        write,
    };
    use crate::system::fake::FakeSystem;
    use crate::system::
    {
        read_file_to_string,
        System,
    };

    #[test]
    fn nanosecond_precision_round_trips()
    {
        let nanoseconds = 1_700_000_000_123_456_789u64;
        let text = nanoseconds_to_string(nanoseconds);
        assert!(text.ends_with(".123456789"));
        assert_eq!(nanoseconds_from_string(&text), Some(nanoseconds));

        /*  Same second, different nanosecond: still distinguishable. */
        let close = nanoseconds + 1;
        assert_ne!(nanoseconds_to_string(close), text);

        assert_eq!(nanoseconds_from_string("not a time"), None);
    }

    #[test]
    fn log_round_trips_through_yaml()
    {
        let system = FakeSystem::new();

        let mut first = PersistentAction::new();
        first.require("in.txt", UpToDate::source(1_000_000_000_123_456_789));
        first.run_action(
            vec!["touch".to_string(), "out.txt".to_string()],
            1_000_000_001_000_000_000);
        first.done_action(1_000_000_002_000_000_000);

        let mut second = PersistentAction::new();
        second.require("all", UpToDate::new("everything", 0));

        write(
            &system, ".dynamake", "compile/name=main",
            &[first.clone(), second.clone()],
            &["out.txt".to_string()]).unwrap();

        assert!(system.is_file(".dynamake/compile/name=main.actions.yaml"));

        match read(&system, ".dynamake", "compile/name=main")
        {
            LoadResult::Loaded{actions, outputs} =>
            {
                assert_eq!(actions, vec![first, second]);
                assert_eq!(outputs, vec!["out.txt".to_string()]);
            },
            _ => panic!("Expected the log to load"),
        }
    }

    #[test]
    fn zero_mtime_serializes_without_a_key()
    {
        let system = FakeSystem::new();

        let mut action = PersistentAction::new();
        action.require("all", UpToDate::new("everything", 0));
        write(&system, ".dynamake", "top", &[action], &[]).unwrap();

        let text = read_file_to_string(
            &system, ".dynamake/top.actions.yaml").unwrap();
        assert!(text.contains("producer: everything"));
        assert!(!text.contains("mtime"));
    }

    #[test]
    fn missing_and_malformed_logs_degrade()
    {
        let system = FakeSystem::new();
        match read(&system, ".dynamake", "absent")
        {
            LoadResult::Missing => {},
            _ => panic!("Expected a missing log"),
        }

        system.write_text_file(".dynamake/broken.actions.yaml", "{{{").unwrap();
        match read(&system, ".dynamake", "broken")
        {
            LoadResult::Invalid(_) => {},
            _ => panic!("Expected an invalid log"),
        }
    }

    #[test]
    fn remove_prunes_empty_parent_directories()
    {
        let system = FakeSystem::new();
        write(&system, ".dynamake", "compile/name=main",
            &[PersistentAction::new()], &[]).unwrap();

        remove(&system, ".dynamake", "compile/name=main");
        assert!(!system.is_file(".dynamake/compile/name=main.actions.yaml"));
        assert!(!system.is_dir(".dynamake/compile"));
        assert!(system.is_dir(".dynamake"));

        /*  Removing a log that is not there is quietly fine. */
        remove(&system, ".dynamake", "compile/name=main");
        assert_eq!(log_path(".dynamake", "top"), ".dynamake/top.actions.yaml");
    }
}
