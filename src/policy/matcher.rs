//! Path globs for include/exclude policy.
//!
//! `**` matches any number of directories, `*` and `?` stay inside one
//! path segment.

use regex::Regex;

/// Translate a path glob to an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    // `**/` may also match nothing
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
                continue;
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    Regex::new(&out)
}

/// Compiled include/exclude sets.
#[derive(Debug, Clone, Default)]
pub struct PathMatcher {
    include: Vec<(String, Regex)>,
    exclude: Vec<(String, Regex)>,
}

impl PathMatcher {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self, regex::Error> {
        let compile = |patterns: &[String]| -> Result<Vec<(String, Regex)>, regex::Error> {
            patterns
                .iter()
                .map(|p| Ok((p.clone(), glob_to_regex(p)?)))
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Why `path` is rejected, or `None` when it is allowed.
    pub fn rejection(&self, path: &str) -> Option<String> {
        let path = path.trim_start_matches("./");
        if let Some((pattern, _)) = self.exclude.iter().find(|(_, re)| re.is_match(path)) {
            return Some(format!("File '{}' matches excluded pattern '{}'", path, pattern));
        }
        if !self.include.is_empty() && !self.include.iter().any(|(_, re)| re.is_match(path)) {
            return Some(format!("File '{}' is outside the included paths", path));
        }
        None
    }
}
