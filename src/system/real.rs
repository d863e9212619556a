use crate::system::
{
    FileStat,
    System,
    SystemError,
};

use filetime::FileTime;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::SystemTime;

#[derive(Clone, Debug)]
pub struct RealSystem
{
}

impl RealSystem
{
    pub fn new() -> RealSystem
    {
        RealSystem{}
    }
}

fn convert_io_error(error : std::io::Error) -> SystemError
{
    match error.kind()
    {
        ErrorKind::NotFound => SystemError::NotFound,
        ErrorKind::AlreadyExists => SystemError::AlreadyExists,
        _ => SystemError::Weird(error.to_string()),
    }
}

fn system_time_to_ns(time : SystemTime) -> Result<u64, SystemError>
{
    match time.duration_since(SystemTime::UNIX_EPOCH)
    {
        Ok(duration) => Ok(duration.as_secs() * 1_000_000_000u64
            + u64::from(duration.subsec_nanos())),
        Err(_) => Err(SystemError::MetadataNotFound),
    }
}

impl System for RealSystem
{
    fn stat(&self, path : &str) -> Result<FileStat, SystemError>
    {
        match fs::metadata(path)
        {
            Ok(metadata) =>
            {
                let modified = match metadata.modified()
                {
                    Ok(modified) => modified,
                    Err(_) => return Err(SystemError::MetadataNotFound),
                };
                Ok(FileStat
                {
                    mtime_ns : system_time_to_ns(modified)?,
                    is_dir : metadata.is_dir(),
                })
            },
            Err(error) => Err(convert_io_error(error)),
        }
    }

    fn is_file(&self, path : &str) -> bool
    {
        Path::new(path).is_file()
    }

    fn is_dir(&self, path : &str) -> bool
    {
        Path::new(path).is_dir()
    }

    fn list_dir(&self, path : &str) -> Result<Vec<String>, SystemError>
    {
        let entries = match fs::read_dir(path)
        {
            Ok(entries) => entries,
            Err(error) => return Err(convert_io_error(error)),
        };

        let mut names = vec![];
        for entry in entries
        {
            match entry
            {
                Ok(entry) =>
                {
                    match entry.file_name().into_string()
                    {
                        Ok(name) => names.push(name),
                        Err(name) => return Err(SystemError::NotUtf8(
                            name.to_string_lossy().to_string())),
                    }
                },
                Err(error) => return Err(convert_io_error(error)),
            }
        }
        Ok(names)
    }

    fn read_file(&self, path : &str) -> Result<Vec<u8>, SystemError>
    {
        match fs::read(path)
        {
            Ok(content) => Ok(content),
            Err(error) => Err(convert_io_error(error)),
        }
    }

    fn write_file(&self, path : &str, content : &[u8]) -> Result<(), SystemError>
    {
        match fs::write(path, content)
        {
            Ok(()) => Ok(()),
            Err(error) => Err(convert_io_error(error)),
        }
    }

    fn create_dir_all(&self, path : &str) -> Result<(), SystemError>
    {
        match fs::create_dir_all(path)
        {
            Ok(()) => Ok(()),
            Err(error) => Err(convert_io_error(error)),
        }
    }

    fn remove_file(&self, path : &str) -> Result<(), SystemError>
    {
        match fs::remove_file(path)
        {
            Ok(()) => Ok(()),
            Err(error) => Err(convert_io_error(error)),
        }
    }

    fn remove_dir(&self, path : &str) -> Result<(), SystemError>
    {
        match fs::remove_dir(path)
        {
            Ok(()) => Ok(()),
            Err(error) => Err(convert_io_error(error)),
        }
    }

    fn remove_dir_all(&self, path : &str) -> Result<(), SystemError>
    {
        match fs::remove_dir_all(path)
        {
            Ok(()) => Ok(()),
            Err(error) => Err(convert_io_error(error)),
        }
    }

    fn touch(&self, path : &str) -> Result<(), SystemError>
    {
        match filetime::set_file_mtime(path, FileTime::now())
        {
            Ok(()) => Ok(()),
            Err(error) => Err(convert_io_error(error)),
        }
    }

    fn now_ns(&self) -> u64
    {
        match system_time_to_ns(SystemTime::now())
        {
            Ok(nanoseconds) => nanoseconds,

            /*  A clock before 1970 has bigger problems than this build. */
            Err(_) => 0,
        }
    }
}
