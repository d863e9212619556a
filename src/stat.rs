use crate::annotated::AnnotatedStr;
use crate::patterns::
{
    clean_path,
    glob_to_regex,
    is_literal_glob,
    PatternError,
};
use crate::system::
{
    FileStat,
    System,
    SystemError,
};

use regex::Regex;
use std::cell::RefCell;
use std::collections::BTreeMap;

/*  Caches stat calls and glob expansions for better performance.  Entries are
    kept sorted so invalidating a subtree is a range scan.  The mutating
    operations go through here so the cache never holds a stale entry for a
    path the engine changed. */
pub struct StatCache<S : System>
{
    system : S,
    cache : RefCell<BTreeMap<String, Result<FileStat, SystemError>>>,
}

impl<S : System> StatCache<S>
{
    pub fn new(system : S) -> StatCache<S>
    {
        StatCache
        {
            system : system,
            cache : RefCell::new(BTreeMap::new()),
        }
    }

    pub fn system(&self) -> &S
    {
        &self.system
    }

    fn result(&self, path : &str) -> Result<FileStat, SystemError>
    {
        let path = clean_path(&AnnotatedStr::new(path)).into_string();

        if let Some(result) = self.cache.borrow().get(&path)
        {
            return result.clone();
        }

        let result = self.system.stat(&path);
        self.cache.borrow_mut().insert(path, result.clone());
        result
    }

    pub fn stat(&self, path : &str) -> Result<FileStat, SystemError>
    {
        self.result(path)
    }

    pub fn try_stat(&self, path : &str) -> Option<FileStat>
    {
        self.result(path).ok()
    }

    pub fn exists(&self, path : &str) -> bool
    {
        self.try_stat(path).is_some()
    }

    pub fn is_file(&self, path : &str) -> bool
    {
        match self.try_stat(path)
        {
            Some(file_stat) => ! file_stat.is_dir,
            None => false,
        }
    }

    pub fn is_dir(&self, path : &str) -> bool
    {
        match self.try_stat(path)
        {
            Some(file_stat) => file_stat.is_dir,
            None => false,
        }
    }

    /*  Forget everything cached about a path, and everything under it if it
        is a directory. */
    pub fn forget(&self, path : &str)
    {
        let path = clean_path(&AnnotatedStr::new(path)).into_string();

        let mut cache = self.cache.borrow_mut();
        cache.remove(&path);

        /*  Descendants all share the "path/" prefix, and in byte order they
            sit in the half-open range ["path/", "path0"), '0' being the
            character after '/'. */
        let lower = format!("{}/", path);
        let upper = format!("{}0", path);
        let doomed : Vec<String> = cache
            .range(lower..upper)
            .map(|(key, _)| key.clone())
            .collect();
        for key in doomed
        {
            cache.remove(&key);
        }
    }

    /*  Expand a glob pattern to the existing paths it matches, sorted.

        A literal pattern short-circuits: if the cache already knows it, the
        answer comes straight from the cache, and otherwise one stat decides.
        Wildcard patterns walk the static prefix directory and full-match the
        translated regular expression against each path found. */
    pub fn glob(&self, pattern : &str) -> Result<Vec<String>, PatternError>
    {
        let pattern = clean_path(&AnnotatedStr::new(pattern)).into_string();

        if let Some(result) = self.cache.borrow().get(&pattern)
        {
            return match result
            {
                Ok(_) => Ok(vec![pattern.clone()]),
                Err(_) => Ok(vec![]),
            };
        }

        if is_literal_glob(&pattern)
        {
            return match self.try_stat(&pattern)
            {
                Some(_) => Ok(vec![pattern]),
                None => Ok(vec![]),
            };
        }

        let body = glob_to_regex(&pattern);
        let regex = match Regex::new(&format!("^(?:{})$", body))
        {
            Ok(regex) => regex,
            Err(error) => return Err(PatternError
            {
                pattern : pattern.clone(),
                offset : 0,
                reason : format!("does not translate to a regexp: {}", error),
            }),
        };

        let root = glob_root(&pattern);
        let mut found = vec![];
        self.walk(&root, &regex, &mut found);
        found.sort();
        Ok(found)
    }

    fn walk(&self, directory : &str, regex : &Regex, found : &mut Vec<String>)
    {
        let names = match self.system.list_dir(directory)
        {
            Ok(names) => names,
            Err(_) => return,
        };

        for name in names
        {
            /*  Hidden entries never match wildcards, as with a shell glob. */
            if name.starts_with('.')
            {
                continue;
            }
            let path = join_path(directory, &name);
            if regex.is_match(&path)
            {
                found.push(path.clone());
            }
            if self.system.is_dir(&path)
            {
                self.walk(&path, regex, found);
            }
        }
    }

    /*  Set the modification time of a path to now. */
    pub fn touch(&self, path : &str) -> Result<(), SystemError>
    {
        let result = self.system.touch(path);
        self.forget(path);
        result
    }

    /*  Force removal of a file or a directory tree. */
    pub fn remove(&self, path : &str) -> Result<(), SystemError>
    {
        let result =
        if self.is_file(path)
        {
            self.system.remove_file(path)
        }
        else if self.exists(path)
        {
            self.system.remove_dir_all(path)
        }
        else
        {
            Ok(())
        };
        self.forget(path);
        result
    }

    /*  Remove an empty directory. */
    pub fn rmdir(&self, path : &str) -> Result<(), SystemError>
    {
        let result = self.system.remove_dir(path);
        self.forget(path);
        result
    }

    /*  Create a new directory; it must not exist yet. */
    pub fn mkdir_create(&self, path : &str) -> Result<(), SystemError>
    {
        if self.exists(path)
        {
            return Err(SystemError::AlreadyExists);
        }
        let result = self.system.create_dir_all(path);
        self.forget(path);
        result
    }

    /*  Ensure a directory exists. */
    pub fn mkdir_exists(&self, path : &str) -> Result<(), SystemError>
    {
        if self.exists(path)
        {
            return Ok(());
        }
        let result = self.system.create_dir_all(path);
        self.forget(path);
        result
    }
}

fn glob_root(pattern : &str) -> String
{
    let meta_index = pattern
        .find(|c| c == '*' || c == '?' || c == '[')
        .unwrap_or(pattern.len());
    let prefix = &pattern[..meta_index];

    match prefix.rfind('/')
    {
        Some(0) => "/".to_string(),
        Some(position) => prefix[..position].to_string(),
        None => ".".to_string(),
    }
}

fn join_path(directory : &str, name : &str) -> String
{
    if directory == "."
    {
        name.to_string()
    }
    else if directory == "/"
    {
        format!("/{}", name)
    }
    else
    {
        format!("{}/{}", directory, name)
    }
}

#[cfg(test)]
mod tests
{
    use crate::stat::
    {
        glob_root,
        StatCache,
    };
    use crate::system::fake::FakeSystem;
    use crate::system::real::RealSystem;
    use crate::system::
    {
        System,
        SystemError,
    };

    fn populated_cache() -> StatCache<FakeSystem>
    {
        let system = FakeSystem::new();
        system.write_text_file("src/main.c", "int main;").unwrap();
        system.write_text_file("src/util.c", "void util;").unwrap();
        system.write_text_file("src/deep/inner.c", "int inner;").unwrap();
        system.write_text_file("notes.txt", "hello").unwrap();
        StatCache::new(system)
    }

    #[test]
    fn stat_is_cached_until_forgotten()
    {
        let cache = populated_cache();
        let before = cache.stat("src/main.c").unwrap();

        /*  Touch behind the cache's back; the cache must not notice. */
        cache.system().touch("src/main.c").unwrap();
        assert_eq!(cache.stat("src/main.c").unwrap(), before);

        cache.forget("src/main.c");
        assert!(cache.stat("src/main.c").unwrap().mtime_ns > before.mtime_ns);
    }

    #[test]
    fn forget_drops_a_whole_subtree()
    {
        let cache = populated_cache();
        cache.stat("src/main.c").unwrap();
        cache.stat("src/deep/inner.c").unwrap();
        cache.stat("notes.txt").unwrap();

        cache.system().touch("src/main.c").unwrap();
        cache.system().touch("src/deep/inner.c").unwrap();

        cache.forget("src");
        let fresh_main = cache.stat("src/main.c").unwrap();
        let fresh_inner = cache.stat("src/deep/inner.c").unwrap();
        assert!(fresh_main.mtime_ns > 0);
        assert!(fresh_inner.mtime_ns > fresh_main.mtime_ns);
    }

    #[test]
    fn glob_expands_wildcards_sorted()
    {
        let cache = populated_cache();
        assert_eq!(
            cache.glob("src/*.c").unwrap(),
            vec!["src/main.c".to_string(), "src/util.c".to_string()]);
        assert_eq!(
            cache.glob("src/**").unwrap(),
            vec![
                "src/deep".to_string(),
                "src/deep/inner.c".to_string(),
                "src/main.c".to_string(),
                "src/util.c".to_string()]);
        assert_eq!(cache.glob("*.missing").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn glob_literal_fast_path_checks_existence()
    {
        let cache = populated_cache();
        assert_eq!(cache.glob("notes.txt").unwrap(), vec!["notes.txt".to_string()]);
        assert_eq!(cache.glob("absent.txt").unwrap(), Vec::<String>::new());

        /*  Once cached as an error, the literal stays empty without another
            stat. */
        assert_eq!(cache.glob("absent.txt").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn remove_keeps_the_cache_coherent()
    {
        let cache = populated_cache();
        assert!(cache.exists("src/main.c"));
        cache.remove("src/main.c").unwrap();
        assert!(!cache.exists("src/main.c"));
        assert_eq!(
            cache.glob("src/*.c").unwrap(),
            vec!["src/util.c".to_string()]);
    }

    #[test]
    fn mkdir_create_rejects_existing()
    {
        let cache = populated_cache();
        assert_eq!(cache.mkdir_create("src"), Err(SystemError::AlreadyExists));
        cache.mkdir_create("fresh").unwrap();
        assert!(cache.is_dir("fresh"));
        cache.mkdir_exists("fresh").unwrap();
    }

    #[test]
    fn glob_roots()
    {
        assert_eq!(glob_root("src/*.c"), "src");
        assert_eq!(glob_root("*.c"), ".");
        assert_eq!(glob_root("/tmp/*.c"), "/tmp");
        assert_eq!(glob_root("/*"), "/");
        assert_eq!(glob_root("a/b/c*.txt"), "a/b");
    }

    #[test]
    fn real_system_round_trips()
    {
        let directory = tempfile::tempdir().unwrap();
        let root = directory.path().to_str().unwrap().to_string();
        let system = RealSystem::new();
        system.write_file(&format!("{}/alpha.txt", root), b"alpha").unwrap();
        system.write_file(&format!("{}/beta.txt", root), b"beta").unwrap();

        let cache = StatCache::new(system);
        assert!(cache.is_file(&format!("{}/alpha.txt", root)));
        assert!(cache.stat(&format!("{}/alpha.txt", root)).unwrap().mtime_ns > 0);

        let found = cache.glob(&format!("{}/*.txt", root)).unwrap();
        assert_eq!(found, vec![
            format!("{}/alpha.txt", root),
            format!("{}/beta.txt", root)]);

        cache.touch(&format!("{}/alpha.txt", root)).unwrap();
        cache.remove(&format!("{}/beta.txt", root)).unwrap();
        assert!(!cache.exists(&format!("{}/beta.txt", root)));
        assert_eq!(
            cache.glob(&format!("{}/*.txt", root)).unwrap(),
            vec![format!("{}/alpha.txt", root)]);
    }
}
