use std::fmt;

pub mod real;

#[cfg(test)]
pub mod fake;

/*  The metadata the engine cares about for one path. */
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FileStat
{
    pub mtime_ns : u64,
    pub is_dir : bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SystemError
{
    NotFound,
    FileInPlaceOfDirectory(String),
    DirectoryInPlaceOfFile(String),
    PathEmpty,
    AlreadyExists,
    RemoveNonExistentFile,
    RemoveNonExistentDir,
    RemoveFileFoundDir,
    RemoveDirFoundFile,
    DirectoryNotEmpty,
    MetadataNotFound,
    NotUtf8(String),
    Weird(String),
}

impl fmt::Display for SystemError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            SystemError::NotFound
                => write!(formatter, "No such file or directory"),

            SystemError::FileInPlaceOfDirectory(component)
                => write!(formatter, "Expected directory, found file: {}", component),

            SystemError::DirectoryInPlaceOfFile(component)
                => write!(formatter, "Expected file, found directory: {}", component),

            SystemError::PathEmpty
                => write!(formatter, "Invalid arguments: found empty path"),

            SystemError::AlreadyExists
                => write!(formatter, "File or directory already exists"),

            SystemError::RemoveNonExistentFile
                => write!(formatter, "Attempt to remove non-existent file"),

            SystemError::RemoveNonExistentDir
                => write!(formatter, "Attempt to remove non-existent directory"),

            SystemError::RemoveFileFoundDir
                => write!(formatter, "Attempt to remove file, found directory"),

            SystemError::RemoveDirFoundFile
                => write!(formatter, "Attempt to remove directory, found file"),

            SystemError::DirectoryNotEmpty
                => write!(formatter, "Attempt to remove a non-empty directory"),

            SystemError::MetadataNotFound
                => write!(formatter, "Attempt to access metadata failed"),

            SystemError::NotUtf8(path)
                => write!(formatter, "Cannot interpret as UTF8: {}", path),

            SystemError::Weird(message)
                => write!(formatter, "Unexpected system error: {}", message),
        }
    }
}

/*  What the engine needs from the filesystem and the clock.  RealSystem
    forwards to the OS; the test FakeSystem keeps an in-memory tree with a
    deterministic nanosecond clock.  Handles are cheap clones sharing state,
    and the engine drives everything from one thread. */
pub trait System : Clone
{
    fn stat(&self, path : &str) -> Result<FileStat, SystemError>;
    fn is_file(&self, path : &str) -> bool;
    fn is_dir(&self, path : &str) -> bool;

    /*  The names (not full paths) of the entries directly inside a
        directory.  "." lists the current directory. */
    fn list_dir(&self, path : &str) -> Result<Vec<String>, SystemError>;

    fn read_file(&self, path : &str) -> Result<Vec<u8>, SystemError>;
    fn write_file(&self, path : &str, content : &[u8]) -> Result<(), SystemError>;

    fn create_dir_all(&self, path : &str) -> Result<(), SystemError>;
    fn remove_file(&self, path : &str) -> Result<(), SystemError>;

    /*  Remove an empty directory. */
    fn remove_dir(&self, path : &str) -> Result<(), SystemError>;

    /*  Remove a directory and everything under it. */
    fn remove_dir_all(&self, path : &str) -> Result<(), SystemError>;

    /*  Set the modification time of an existing file or directory to now. */
    fn touch(&self, path : &str) -> Result<(), SystemError>;

    /*  The current wall-clock time in nanoseconds since the epoch. */
    fn now_ns(&self) -> u64;
}

pub fn read_file_to_string<S : System>(system : &S, path : &str)
    -> Result<String, SystemError>
{
    let content = system.read_file(path)?;
    match String::from_utf8(content)
    {
        Ok(text) => Ok(text),
        Err(_) => Err(SystemError::NotUtf8(path.to_string())),
    }
}
