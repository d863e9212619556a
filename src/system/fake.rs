use crate::system::
{
    FileStat,
    System,
    SystemError,
};

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

#[derive(Clone, Debug)]
struct FakeNode
{
    is_dir : bool,
    mtime_ns : u64,
    content : Vec<u8>,
}

#[derive(Debug)]
struct FakeState
{
    nodes : BTreeMap<String, FakeNode>,
    now_ns : u64,
}

/*  An in-memory filesystem with a deterministic clock.  Every observation or
    mutation ticks the clock forward by one microsecond, so no two events ever
    share a timestamp and tests never depend on wall-clock ordering.  Clones
    share the same state, like real filesystem handles do. */
#[derive(Clone, Debug)]
pub struct FakeSystem
{
    state : Rc<RefCell<FakeState>>,
}

const TICK_NS : u64 = 1_000;

impl FakeSystem
{
    pub fn new() -> FakeSystem
    {
        FakeSystem
        {
            state : Rc::new(RefCell::new(FakeState
            {
                nodes : BTreeMap::new(),
                now_ns : 1_000_000_000_000_000u64,
            })),
        }
    }

    fn tick(&self) -> u64
    {
        let mut state = self.state.borrow_mut();
        state.now_ns += TICK_NS;
        state.now_ns
    }

    /*  Push the clock forward, as when a test wants an input to become
        decisively newer than an output. */
    pub fn advance_ns(&self, delta : u64)
    {
        self.state.borrow_mut().now_ns += delta;
    }

    pub fn write_text_file(&self, path : &str, content : &str)
        -> Result<(), SystemError>
    {
        self.write_file(path, content.as_bytes())
    }

    /*  Ensure every ancestor directory of the path exists.  The fake is
        lenient here so tests can write "src/main.c" without ceremony. */
    fn ensure_parents(&self, path : &str) -> Result<(), SystemError>
    {
        let mut index = 0;
        while let Some(position) = path[index..].find('/')
        {
            let parent = &path[..index + position];
            index += position + 1;
            if parent.is_empty()
            {
                continue;
            }

            let mtime_ns = self.tick();
            let mut state = self.state.borrow_mut();
            match state.nodes.get(parent)
            {
                Some(node) if ! node.is_dir =>
                {
                    return Err(SystemError::FileInPlaceOfDirectory(parent.to_string()));
                },
                Some(_) => {},
                None =>
                {
                    state.nodes.insert(parent.to_string(), FakeNode
                    {
                        is_dir : true,
                        mtime_ns : mtime_ns,
                        content : vec![],
                    });
                },
            }
        }
        Ok(())
    }
}

impl System for FakeSystem
{
    fn stat(&self, path : &str) -> Result<FileStat, SystemError>
    {
        if path.is_empty()
        {
            return Err(SystemError::PathEmpty);
        }

        if path == "."
        {
            return Ok(FileStat{mtime_ns : 0, is_dir : true});
        }

        match self.state.borrow().nodes.get(path)
        {
            Some(node) => Ok(FileStat
            {
                mtime_ns : node.mtime_ns,
                is_dir : node.is_dir,
            }),
            None => Err(SystemError::NotFound),
        }
    }

    fn is_file(&self, path : &str) -> bool
    {
        match self.stat(path)
        {
            Ok(file_stat) => ! file_stat.is_dir,
            Err(_) => false,
        }
    }

    fn is_dir(&self, path : &str) -> bool
    {
        match self.stat(path)
        {
            Ok(file_stat) => file_stat.is_dir,
            Err(_) => false,
        }
    }

    fn list_dir(&self, path : &str) -> Result<Vec<String>, SystemError>
    {
        let state = self.state.borrow();

        if path != "."
        {
            match state.nodes.get(path)
            {
                Some(node) if node.is_dir => {},
                Some(_) => return Err(SystemError::FileInPlaceOfDirectory(path.to_string())),
                None => return Err(SystemError::NotFound),
            }
        }

        let prefix =
        if path == "."
        {
            String::new()
        }
        else
        {
            format!("{}/", path)
        };

        let mut names = vec![];
        for key in state.nodes.keys()
        {
            if let Some(rest) = key.strip_prefix(&prefix)
            {
                if ! rest.is_empty() && ! rest.contains('/')
                {
                    names.push(rest.to_string());
                }
            }
        }
        Ok(names)
    }

    fn read_file(&self, path : &str) -> Result<Vec<u8>, SystemError>
    {
        match self.state.borrow().nodes.get(path)
        {
            Some(node) if node.is_dir =>
                Err(SystemError::DirectoryInPlaceOfFile(path.to_string())),
            Some(node) => Ok(node.content.clone()),
            None => Err(SystemError::NotFound),
        }
    }

    fn write_file(&self, path : &str, content : &[u8]) -> Result<(), SystemError>
    {
        if path.is_empty()
        {
            return Err(SystemError::PathEmpty);
        }

        self.ensure_parents(path)?;
        let mtime_ns = self.tick();
        let mut state = self.state.borrow_mut();

        if let Some(node) = state.nodes.get(path)
        {
            if node.is_dir
            {
                return Err(SystemError::DirectoryInPlaceOfFile(path.to_string()));
            }
        }

        state.nodes.insert(path.to_string(), FakeNode
        {
            is_dir : false,
            mtime_ns : mtime_ns,
            content : content.to_vec(),
        });
        Ok(())
    }

    fn create_dir_all(&self, path : &str) -> Result<(), SystemError>
    {
        if path.is_empty()
        {
            return Err(SystemError::PathEmpty);
        }

        self.ensure_parents(&format!("{}/", path))?;
        Ok(())
    }

    fn remove_file(&self, path : &str) -> Result<(), SystemError>
    {
        let mut state = self.state.borrow_mut();
        match state.nodes.get(path)
        {
            Some(node) if node.is_dir => Err(SystemError::RemoveFileFoundDir),
            Some(_) =>
            {
                state.nodes.remove(path);
                Ok(())
            },
            None => Err(SystemError::RemoveNonExistentFile),
        }
    }

    fn remove_dir(&self, path : &str) -> Result<(), SystemError>
    {
        let mut state = self.state.borrow_mut();
        match state.nodes.get(path)
        {
            Some(node) if ! node.is_dir => Err(SystemError::RemoveDirFoundFile),
            Some(_) =>
            {
                let prefix = format!("{}/", path);
                if state.nodes.keys().any(|key| key.starts_with(&prefix))
                {
                    return Err(SystemError::DirectoryNotEmpty);
                }
                state.nodes.remove(path);
                Ok(())
            },
            None => Err(SystemError::RemoveNonExistentDir),
        }
    }

    fn remove_dir_all(&self, path : &str) -> Result<(), SystemError>
    {
        let mut state = self.state.borrow_mut();
        match state.nodes.get(path)
        {
            Some(node) if ! node.is_dir => Err(SystemError::RemoveDirFoundFile),
            Some(_) =>
            {
                let prefix = format!("{}/", path);
                let doomed : Vec<String> = state.nodes.keys()
                    .filter(|key| key.as_str() == path || key.starts_with(&prefix))
                    .cloned()
                    .collect();
                for key in doomed
                {
                    state.nodes.remove(&key);
                }
                Ok(())
            },
            None => Err(SystemError::RemoveNonExistentDir),
        }
    }

    fn touch(&self, path : &str) -> Result<(), SystemError>
    {
        let mtime_ns = self.tick();
        let mut state = self.state.borrow_mut();
        match state.nodes.get_mut(path)
        {
            Some(node) =>
            {
                node.mtime_ns = mtime_ns;
                Ok(())
            },
            None => Err(SystemError::NotFound),
        }
    }

    fn now_ns(&self) -> u64
    {
        self.tick()
    }
}

#[cfg(test)]
mod tests
{
    use crate::system::fake::FakeSystem;
    use crate::system::
    {
        read_file_to_string,
        System,
        SystemError,
    };

    #[test]
    fn write_then_read_round_trips()
    {
        let system = FakeSystem::new();
        system.write_text_file("verse1.txt", "Roses are red.\n").unwrap();
        assert_eq!(
            read_file_to_string(&system, "verse1.txt").unwrap(),
            "Roses are red.\n");
    }

    #[test]
    fn writing_creates_parent_directories()
    {
        let system = FakeSystem::new();
        system.write_text_file("a/b/c.txt", "deep").unwrap();
        assert!(system.is_dir("a"));
        assert!(system.is_dir("a/b"));
        assert!(system.is_file("a/b/c.txt"));
        assert_eq!(system.list_dir("a").unwrap(), vec!["b".to_string()]);
    }

    #[test]
    fn clock_ticks_between_writes()
    {
        let system = FakeSystem::new();
        system.write_text_file("first.txt", "").unwrap();
        system.write_text_file("second.txt", "").unwrap();
        let first = system.stat("first.txt").unwrap().mtime_ns;
        let second = system.stat("second.txt").unwrap().mtime_ns;
        assert!(first < second);
    }

    #[test]
    fn touch_advances_the_modification_time()
    {
        let system = FakeSystem::new();
        system.write_text_file("a.txt", "").unwrap();
        let before = system.stat("a.txt").unwrap().mtime_ns;
        system.touch("a.txt").unwrap();
        let after = system.stat("a.txt").unwrap().mtime_ns;
        assert!(before < after);
    }

    #[test]
    fn remove_dir_insists_on_empty()
    {
        let system = FakeSystem::new();
        system.write_text_file("dir/file.txt", "").unwrap();
        assert_eq!(system.remove_dir("dir"), Err(SystemError::DirectoryNotEmpty));
        system.remove_file("dir/file.txt").unwrap();
        system.remove_dir("dir").unwrap();
        assert!(!system.is_dir("dir"));
    }

    #[test]
    fn clones_share_state()
    {
        let system = FakeSystem::new();
        let other = system.clone();
        system.write_text_file("shared.txt", "one").unwrap();
        assert!(other.is_file("shared.txt"));
    }
}
