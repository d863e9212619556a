use crate::annotated::AnnotatedStr;
use crate::stat::StatCache;
use crate::system::System;

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;

/*  The wildcard values extracted from one matched path, keyed by the captured
    names.  Sorted so invocation canonical names come out deterministic. */
pub type Bindings = BTreeMap<String, String>;

/*  An error in a capture pattern or glob, carrying the offending pattern and
    the character offset of the fault so the message can point at it. */
#[derive(Debug, PartialEq)]
pub struct PatternError
{
    pub pattern : String,
    pub offset : usize,
    pub reason : String,
}

impl PatternError
{
    fn new(pattern : &[char], offset : usize, reason : &str) -> PatternError
    {
        PatternError
        {
            pattern : pattern.iter().collect(),
            offset : offset,
            reason : reason.to_string(),
        }
    }
}

impl fmt::Display for PatternError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        write!(formatter, "Invalid capture pattern:\n{}\n{}^ {}",
            self.pattern, " ".repeat(self.offset), self.reason)
    }
}

#[derive(Debug)]
pub enum GlobError
{
    Pattern(PatternError),

    /*  A pattern without the optional annotation matched no existing path. */
    NonOptionalPatternDidNotMatch
    {
        glob : String,
        pattern : String,
    },

    /*  A path handed to match_extract did not match the pattern at all. */
    Mismatch
    {
        string : String,
        pattern : String,
    },
}

impl fmt::Display for GlobError
{
    fn fmt(&self, formatter : &mut fmt::Formatter) -> fmt::Result
    {
        match self
        {
            GlobError::Pattern(error) =>
                write!(formatter, "{}", error),

            GlobError::NonOptionalPatternDidNotMatch{glob, pattern} =>
            {
                if glob == pattern
                {
                    write!(formatter, "No files matched the non-optional glob pattern: {}", glob)
                }
                else
                {
                    write!(formatter, "No files matched the non-optional glob: {} pattern: {}",
                        glob, pattern)
                }
            },

            GlobError::Mismatch{string, pattern} =>
                write!(formatter, "The string: {} does not match the capture pattern: {}",
                    string, pattern),
        }
    }
}

impl From<PatternError> for GlobError
{
    fn from(error : PatternError) -> GlobError
    {
        GlobError::Pattern(error)
    }
}

fn is_name_char(c : char) -> bool
{
    c == '_' || c.is_ascii_alphanumeric()
}

/*  Escape a character for insertion into a regular expression. */
fn push_escaped(results : &mut String, c : char)
{
    if regex_syntax_char(c)
    {
        results.push('\\');
    }
    results.push(c);
}

fn regex_syntax_char(c : char) -> bool
{
    match c
    {
        '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}'
            | '^' | '$' | '#' | '&' | '-' | '~' => true,
        _ => false,
    }
}

struct Scanner<'a>
{
    chars : &'a [char],
    index : usize,
}

impl<'a> Scanner<'a>
{
    fn new(chars : &'a [char]) -> Scanner<'a>
    {
        Scanner
        {
            chars : chars,
            index : 0,
        }
    }

    fn next(&mut self) -> Option<char>
    {
        match self.chars.get(self.index)
        {
            Some(c) =>
            {
                self.index += 1;
                Some(*c)
            },
            None => None,
        }
    }

    fn is_next(&self, expected : char) -> bool
    {
        self.chars.get(self.index) == Some(&expected)
    }

    fn invalid(&self, reason : &str) -> PatternError
    {
        PatternError::new(self.chars, self.index, reason)
    }

    fn expect_close(&mut self) -> Result<(), PatternError>
    {
        if ! self.is_next('}')
        {
            return Err(self.invalid("missing }"));
        }
        self.index += 1;
        Ok(())
    }

    fn parse_name(&mut self, terminators : &str) -> Result<String, PatternError>
    {
        let start_index = self.index;
        while let Some(c) = self.chars.get(self.index)
        {
            if terminators.contains(*c)
            {
                break;
            }
            if ! is_name_char(*c)
            {
                return Err(self.invalid("invalid captured name character"));
            }
            self.index += 1;
        }
        if self.index == start_index
        {
            return Err(self.invalid("empty captured name"));
        }
        Ok(self.chars[start_index..self.index].iter().collect())
    }

    /*  Parse an optional ":sub" glob after a captured name, returning it
        translated to a regular expression. */
    fn parse_sub_regexp(&mut self) -> Result<Option<String>, PatternError>
    {
        if ! self.is_next(':')
        {
            return Ok(None);
        }
        self.index += 1;

        let start_index = self.index;
        while self.index < self.chars.len() && ! self.is_next('}')
        {
            self.index += 1;
        }

        if self.index == start_index
        {
            return Err(self.invalid("empty captured regexp"));
        }

        let sub : String = self.chars[start_index..self.index].iter().collect();
        Ok(Some(glob_to_regex(&sub)))
    }

    /*  Parse an optional ":sub" glob, returning it verbatim. */
    fn parse_sub_glob(&mut self) -> Option<String>
    {
        if ! self.is_next(':')
        {
            return None;
        }
        self.index += 1;

        let start_index = self.index;
        while self.index < self.chars.len() && ! self.is_next('}')
        {
            self.index += 1;
        }
        Some(self.chars[start_index..self.index].iter().collect())
    }
}

fn append_group(results : &mut String, name : &str, regexp : &str, prefix : &str, suffix : &str)
{
    results.push_str(prefix);
    results.push_str("(?P<");
    results.push_str(name);
    results.push('>');
    results.push_str(regexp);
    results.push(')');
    results.push_str(suffix);
}

/*  Translate a capture pattern to the equivalent anchored regular expression
    body, with one named group per wildcard. */
pub fn capture_to_regex(capture : &str) -> Result<String, PatternError>
{
    let chars : Vec<char> = capture.chars().collect();
    let mut scanner = Scanner::new(&chars);
    let mut results = String::new();

    while let Some(c) = scanner.next()
    {
        if c == '}' && scanner.is_next('}')
        {
            push_escaped(&mut results, '}');
            scanner.index += 1;
        }
        else if c == '{' && scanner.is_next('{')
        {
            push_escaped(&mut results, '{');
            scanner.index += 1;
        }
        else if c == '{' && scanner.is_next('*')
        {
            scanner.index += 1;
            if scanner.is_next('*')
            {
                scanner.index += 1;
                let name = scanner.parse_name(":}")?;
                let regexp = match scanner.parse_sub_regexp()?
                {
                    Some(sub) => sub,
                    None => ".*".to_string(),
                };
                scanner.expect_close()?;

                /*  Between two slashes, the wildcard and its trailing slash
                    collapse so the empty binding matches too. */
                if results.ends_with('/') && scanner.is_next('/')
                {
                    scanner.index += 1;
                    append_group(&mut results, &name, &regexp, "(?:", "/)?");
                }
                else
                {
                    append_group(&mut results, &name, &regexp, "", "");
                }
            }
            else
            {
                let name = scanner.parse_name(":}")?;
                let regexp = match scanner.parse_sub_regexp()?
                {
                    Some(sub) => sub,
                    None => "[^/]*".to_string(),
                };
                scanner.expect_close()?;
                append_group(&mut results, &name, &regexp, "", "");
            }
        }
        else if c == '/'
        {
            results.push(c);
        }
        else
        {
            push_escaped(&mut results, c);
        }
    }

    Ok(results)
}

/*  Translate a capture pattern to the equivalent filesystem glob. */
pub fn capture_to_glob(capture : &str) -> Result<String, PatternError>
{
    let chars : Vec<char> = capture.chars().collect();
    let mut scanner = Scanner::new(&chars);
    let mut results = String::new();

    while let Some(c) = scanner.next()
    {
        if c == '}' && scanner.is_next('}')
        {
            results.push('}');
            scanner.index += 1;
        }
        else if c == '{' && scanner.is_next('{')
        {
            results.push('{');
            scanner.index += 1;
        }
        else if c == '{' && scanner.is_next('*')
        {
            scanner.index += 1;
            let default_glob =
            if scanner.is_next('*')
            {
                scanner.index += 1;
                "**"
            }
            else
            {
                "*"
            };

            scanner.parse_name(":}")?;
            let glob = match scanner.parse_sub_glob()
            {
                Some(sub) => sub,
                None => default_glob.to_string(),
            };
            scanner.expect_close()?;
            results.push_str(&glob);
        }
        else
        {
            results.push(c);
        }
    }

    Ok(results)
}

/*  Translate a glob pattern to the equivalent regular expression body.

    This is subtly different from the usual fnmatch translation because it is
    used to match paths a successful glob already returned, not to perform the
    glob itself. */
pub fn glob_to_regex(glob : &str) -> String
{
    let chars : Vec<char> = glob.chars().collect();
    let mut index = 0;
    let mut results = String::new();

    while index < chars.len()
    {
        let c = chars[index];
        index += 1;

        match c
        {
            '*' =>
            {
                if chars.get(index) == Some(&'*')
                {
                    index += 1;
                    if results.ends_with('/') && chars.get(index) == Some(&'/')
                    {
                        results.push_str("(.*/)?");
                        index += 1;
                    }
                    else
                    {
                        results.push_str(".*");
                    }
                }
                else
                {
                    results.push_str("[^/]*");
                }
            },

            '?' =>
            {
                results.push_str("[^/]");
            },

            '[' =>
            {
                let mut end_index = index;
                while end_index < chars.len() && chars[end_index] != ']'
                {
                    end_index += 1;
                }

                if end_index >= chars.len() || end_index == index
                {
                    /*  Unterminated or empty class: a literal bracket. */
                    results.push_str("\\[");
                }
                else
                {
                    let characters : String = chars[index..end_index]
                        .iter()
                        .collect::<String>()
                        .replace('\\', "\\\\");
                    index = end_index + 1;

                    results.push('[');
                    if characters.starts_with('!')
                    {
                        results.push_str("^/");
                        results.push_str(&characters[1..]);
                    }
                    else if characters.starts_with('^')
                    {
                        results.push('\\');
                        results.push_str(&characters);
                    }
                    else
                    {
                        results.push_str(&characters);
                    }
                    results.push(']');
                }
            },

            '/' =>
            {
                results.push(c);
            },

            _ =>
            {
                push_escaped(&mut results, c);
            },
        }
    }

    results
}

/*  Replace the named slots and the captured wildcards whose name appears in
    the bindings, leaving unknown wildcards (and their sub-globs) verbatim so
    later stages can still glob and match them.  Braces inside substituted
    values are doubled to survive a later format_template. */
pub fn substitute(bindings : &Bindings, pattern : &AnnotatedStr)
    -> Result<AnnotatedStr, PatternError>
{
    let chars : Vec<char> = pattern.chars().collect();
    let mut scanner = Scanner::new(&chars);
    let mut results = String::new();

    while let Some(c) = scanner.next()
    {
        if c == '}' && scanner.is_next('}')
        {
            results.push_str("}}");
            scanner.index += 1;
        }
        else if c == '{' && scanner.is_next('{')
        {
            results.push_str("{{");
            scanner.index += 1;
        }
        else if c == '{'
        {
            let mut stars = 0;
            while scanner.is_next('*')
            {
                scanner.index += 1;
                stars += 1;
            }
            let name = scanner.parse_name(":}")?;
            match bindings.get(&name)
            {
                Some(value) =>
                {
                    results.push_str(
                        &value.replace('{', "{{").replace('}', "}}"));
                    scanner.parse_sub_glob();
                    scanner.expect_close()?;
                },
                None =>
                {
                    results.push('{');
                    for _ in 0..stars
                    {
                        results.push('*');
                    }
                    results.push_str(&name);
                    if let Some(sub) = scanner.parse_sub_glob()
                    {
                        results.push(':');
                        results.push_str(&sub);
                    }
                    scanner.expect_close()?;
                    results.push('}');
                },
            }
        }
        else
        {
            results.push(c);
        }
    }

    Ok(pattern.with_text(results))
}

/*  Expand the named "{name}" slots of a template, preserving the template's
    annotations on the result. */
pub fn format_template(bindings : &Bindings, template : &AnnotatedStr)
    -> Result<AnnotatedStr, PatternError>
{
    let chars : Vec<char> = template.chars().collect();
    let mut scanner = Scanner::new(&chars);
    let mut results = String::new();

    while let Some(c) = scanner.next()
    {
        if c == '}' && scanner.is_next('}')
        {
            results.push('}');
            scanner.index += 1;
        }
        else if c == '{' && scanner.is_next('{')
        {
            results.push('{');
            scanner.index += 1;
        }
        else if c == '{'
        {
            let name = scanner.parse_name("}")?;
            scanner.expect_close()?;
            match bindings.get(&name)
            {
                Some(value) => results.push_str(value),
                None =>
                {
                    return Err(PatternError::new(
                        &chars, scanner.index,
                        &format!("unknown name: {}", name)));
                },
            }
        }
        else if c == '}'
        {
            return Err(scanner.invalid("single } in format template"));
        }
        else
        {
            results.push(c);
        }
    }

    Ok(template.with_text(results))
}

/*  Return a clean and hopefully canonical path: repeated slashes collapse to
    one, and a trailing slash is stripped.  Absolute paths are left absolute;
    relative match patterns would break if paths were made absolute here. */
pub fn clean_path(path : &AnnotatedStr) -> AnnotatedStr
{
    let mut text = path.as_str().to_string();
    while text.contains("//")
    {
        text = text.replace("//", "/");
    }
    if text.len() > 1 && text.ends_with('/')
    {
        text.pop();
    }
    path.with_text(text)
}

/*  True when the pattern contains no glob wildcards and therefore names a
    single literal path. */
pub fn is_literal_glob(pattern : &str) -> bool
{
    ! pattern.contains('*') && ! pattern.contains('?') && ! pattern.contains('[')
}

/*  The results of matching capture patterns against existing paths. */
#[derive(Debug)]
pub struct Captured
{
    /*  The existing paths that matched, annotated like their patterns. */
    pub paths : Vec<AnnotatedStr>,

    /*  The wildcard values captured from each matched path, in the same
        order. */
    pub bindings : Vec<Bindings>,
}

impl Captured
{
    pub fn new() -> Captured
    {
        Captured
        {
            paths : vec![],
            bindings : vec![],
        }
    }
}

fn compile_anchored(body : &str, pattern : &str) -> Result<Regex, PatternError>
{
    match Regex::new(&format!("^(?:{})$", body))
    {
        Ok(regex) => Ok(regex),
        Err(error) => Err(PatternError
        {
            pattern : pattern.to_string(),
            offset : 0,
            reason : format!("does not translate to a regexp: {}", error),
        }),
    }
}

/*  Build an anchored matcher for a capture pattern. */
pub fn capture_regex(pattern : &str) -> Result<Regex, PatternError>
{
    let body = capture_to_regex(pattern)?;
    compile_anchored(&body, pattern)
}

fn capture_string(pattern : &str, regex : &Regex, string : &str)
    -> Result<Bindings, GlobError>
{
    let captures = match regex.captures(string)
    {
        Some(captures) => captures,
        None =>
        {
            return Err(GlobError::Mismatch
            {
                string : string.to_string(),
                pattern : pattern.to_string(),
            });
        },
    };

    let mut bindings = Bindings::new();
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
    Ok(bindings)
}

/*  Glob each capture pattern against the filesystem (through the stat cache)
    and capture the wildcard values out of every matching path.  A pattern
    without the optional annotation that matches nothing is an error carrying
    the glob it tried. */
pub fn glob_capture<S : System>(stat : &StatCache<S>, patterns : &[AnnotatedStr])
    -> Result<Captured, GlobError>
{
    let mut captured = Captured::new();
    for pattern in patterns
    {
        let regex = capture_regex(pattern.as_str())?;
        let glob = capture_to_glob(pattern.as_str())?;
        let mut paths = stat.glob(&glob)?;

        if paths.is_empty() && ! pattern.optional
        {
            return Err(GlobError::NonOptionalPatternDidNotMatch
            {
                glob : glob,
                pattern : pattern.as_str().to_string(),
            });
        }

        /*  Sorted to make runs deterministic. */
        paths.sort();
        for path in paths
        {
            captured.bindings.push(capture_string(pattern.as_str(), &regex, &path)?);
            captured.paths.push(pattern.with_text(path));
        }
    }
    Ok(captured)
}

/*  Like glob_capture, returning just the matching paths. */
pub fn glob_paths<S : System>(stat : &StatCache<S>, patterns : &[AnnotatedStr])
    -> Result<Vec<AnnotatedStr>, GlobError>
{
    Ok(glob_capture(stat, patterns)?.paths)
}

/*  Like glob_capture, returning just the captured wildcard values. */
pub fn glob_extract<S : System>(stat : &StatCache<S>, patterns : &[AnnotatedStr])
    -> Result<Vec<Bindings>, GlobError>
{
    Ok(glob_capture(stat, patterns)?.bindings)
}

/*  Capture each string with one pattern, without touching the filesystem. */
pub fn match_extract(pattern : &str, strings : &[&str]) -> Result<Vec<Bindings>, GlobError>
{
    let regex = capture_regex(pattern)?;
    let mut results = vec![];
    for string in strings
    {
        results.push(capture_string(pattern, &regex, string)?);
    }
    Ok(results)
}

/*  For each path matching the capture pattern, extract its wildcards and use
    them to format each of the templates. */
pub fn glob_format<S : System>(
    stat : &StatCache<S>,
    pattern : &AnnotatedStr,
    templates : &[AnnotatedStr])
    -> Result<Vec<AnnotatedStr>, GlobError>
{
    let mut results = vec![];
    for bindings in glob_extract(stat, &[pattern.clone()])?
    {
        for template in templates
        {
            results.push(format_template(&bindings, template)?);
        }
    }
    Ok(results)
}

#[cfg(test)]
mod tests
{
    use crate::annotated::
    {
        AnnotatedStr,
        optional,
    };
    use crate::patterns::
    {
        Bindings,
        GlobError,
        capture_regex,
        capture_to_glob,
        capture_to_regex,
        clean_path,
        format_template,
        glob_capture,
        glob_to_regex,
        match_extract,
        substitute,
    };
    use crate::stat::StatCache;
    use crate::system::fake::FakeSystem;

    fn bindings(pairs : &[(&str, &str)]) -> Bindings
    {
        let mut result = Bindings::new();
        for (name, value) in pairs
        {
            result.insert(name.to_string(), value.to_string());
        }
        result
    }

    #[test]
    fn glob_translates_to_regex()
    {
        assert_eq!(glob_to_regex("*.py"), "[^/]*\\.py");
        assert_eq!(glob_to_regex("?"), "[^/]");
        assert_eq!(glob_to_regex("a/**/b"), "a/(.*/)?b");
        assert_eq!(glob_to_regex("**"), ".*");
        assert_eq!(glob_to_regex("[ab]"), "[ab]");
        assert_eq!(glob_to_regex("[!ab]"), "[^/ab]");
        assert_eq!(glob_to_regex("[^ab]"), "[\\^ab]");
        assert_eq!(glob_to_regex("[ab"), "\\[ab");
    }

    #[test]
    fn capture_translates_to_regex()
    {
        assert_eq!(capture_to_regex("{*name}.txt").unwrap(), "(?P<name>[^/]*)\\.txt");
        assert_eq!(capture_to_regex("foo/{**n}/baz").unwrap(), "foo/(?:(?P<n>.*)/)?baz");
        assert_eq!(capture_to_regex("{*digit:[0-9]}").unwrap(), "(?P<digit>[0-9])");
        assert_eq!(capture_to_regex("{{literal}}").unwrap(), "\\{literal\\}");
    }

    #[test]
    fn two_star_pattern_matches_empty_segment()
    {
        let regex = capture_regex("foo/{**n}/baz").unwrap();

        let captures = regex.captures("foo/baz").unwrap();
        assert!(captures.name("n").is_none());

        let captures = regex.captures("foo/x/y/baz").unwrap();
        assert_eq!(captures.name("n").unwrap().as_str(), "x/y");
    }

    #[test]
    fn capture_translates_to_glob()
    {
        assert_eq!(capture_to_glob("{*name}.txt").unwrap(), "*.txt");
        assert_eq!(capture_to_glob("foo/{**n}/baz").unwrap(), "foo/**/baz");
        assert_eq!(capture_to_glob("{*digit:[0-9]}.txt").unwrap(), "[0-9].txt");
        assert_eq!(capture_to_glob("{{x}}").unwrap(), "{x}");
    }

    #[test]
    fn unterminated_wildcard_is_an_error_with_position()
    {
        let error = capture_to_regex("foo/{*name").unwrap_err();
        assert_eq!(error.offset, 10);
        assert_eq!(error.reason, "missing }");
        let message = format!("{}", error);
        assert!(message.contains("foo/{*name"));
        assert!(message.contains("          ^ missing }"));
    }

    #[test]
    fn empty_name_is_an_error_with_position()
    {
        let error = capture_to_regex("{*}.txt").unwrap_err();
        assert_eq!(error.offset, 2);
        assert_eq!(error.reason, "empty captured name");
    }

    #[test]
    fn empty_sub_glob_is_an_error_with_position()
    {
        let error = capture_to_regex("{*name:}.txt").unwrap_err();
        assert_eq!(error.reason, "empty captured regexp");
    }

    #[test]
    fn invalid_name_character_is_an_error()
    {
        let error = capture_to_regex("{*na me}").unwrap_err();
        assert_eq!(error.reason, "invalid captured name character");
    }

    #[test]
    fn substitute_replaces_known_wildcards_only()
    {
        let pattern = AnnotatedStr::new("{*dir}/{*name:[a-z]*}.o");
        let result = substitute(&bindings(&[("dir", "obj")]), &pattern).unwrap();
        assert_eq!(result.as_str(), "obj/{*name:[a-z]*}.o");

        let result = substitute(
            &bindings(&[("dir", "obj"), ("name", "main")]), &pattern).unwrap();
        assert_eq!(result.as_str(), "obj/main.o");
    }

    #[test]
    fn substitute_doubles_braces_in_values()
    {
        let pattern = AnnotatedStr::new("{*x}.txt");
        let result = substitute(&bindings(&[("x", "a{b}c")]), &pattern).unwrap();
        assert_eq!(result.as_str(), "a{{b}}c.txt");

        let formatted = format_template(&Bindings::new(), &result).unwrap();
        assert_eq!(formatted.as_str(), "a{b}c.txt");
    }

    #[test]
    fn format_expands_named_slots_and_preserves_annotations()
    {
        let template = optional(AnnotatedStr::new("out/{name}.txt"));
        let result = format_template(&bindings(&[("name", "report")]), &template).unwrap();
        assert_eq!(result.as_str(), "out/report.txt");
        assert!(result.optional);
    }

    #[test]
    fn format_rejects_unknown_names()
    {
        let template = AnnotatedStr::new("out/{name}.txt");
        let error = format_template(&Bindings::new(), &template).unwrap_err();
        assert!(error.reason.contains("unknown name: name"));
    }

    #[test]
    fn clean_path_collapses_slashes()
    {
        assert_eq!(clean_path(&AnnotatedStr::new("a//b///c")).as_str(), "a/b/c");
        assert_eq!(clean_path(&AnnotatedStr::new("a/b/")).as_str(), "a/b");
        assert_eq!(clean_path(&AnnotatedStr::new("/")).as_str(), "/");
    }

    #[test]
    fn match_extract_drops_underscore_names()
    {
        let extracted = match_extract("{*_dir}/{*name}.c", &["src/main.c"]).unwrap();
        assert_eq!(extracted.len(), 1);
        assert_eq!(extracted[0].get("name").unwrap(), "main");
        assert!(extracted[0].get("_dir").is_none());
    }

    #[test]
    fn match_extract_rejects_mismatched_string()
    {
        match match_extract("{*name}.c", &["main.o"])
        {
            Err(GlobError::Mismatch{string, pattern}) =>
            {
                assert_eq!(string, "main.o");
                assert_eq!(pattern, "{*name}.c");
            },
            _ => panic!("Expected a mismatch error"),
        }
    }

    #[test]
    fn glob_capture_round_trips_through_format()
    {
        let mut system = FakeSystem::new();
        system.write_text_file("src/main.c", "int main;").unwrap();
        system.write_text_file("src/util.c", "void util;").unwrap();
        let stat = StatCache::new(system);

        let captured = glob_capture(
            &stat, &[AnnotatedStr::new("src/{*name}.c")]).unwrap();
        assert_eq!(captured.paths.len(), 2);
        assert_eq!(captured.paths[0].as_str(), "src/main.c");
        assert_eq!(captured.paths[1].as_str(), "src/util.c");

        let template = AnnotatedStr::new("src/{name}.c");
        for (path, bindings) in captured.paths.iter().zip(captured.bindings.iter())
        {
            let formatted = format_template(bindings, &template).unwrap();
            assert_eq!(formatted.as_str(), path.as_str());
        }
    }

    #[test]
    fn glob_capture_requires_non_optional_matches()
    {
        let stat = StatCache::new(FakeSystem::new());
        match glob_capture(&stat, &[AnnotatedStr::new("src/{*name}.c")])
        {
            Err(GlobError::NonOptionalPatternDidNotMatch{glob, ..}) =>
                assert_eq!(glob, "src/*.c"),
            _ => panic!("Expected a non-optional glob error"),
        }

        let captured = glob_capture(&stat, &[optional("src/{*name}.c")]).unwrap();
        assert_eq!(captured.paths.len(), 0);
    }
}
