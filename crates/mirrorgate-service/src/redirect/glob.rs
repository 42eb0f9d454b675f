use std::fmt;

use regex::Regex;
use thiserror::Error;

/// Matches one path segment and its trailing separator, any number of times.
const ANY_DIRS: &str = r"(?:[^/\\]+[/\\])*";
/// Matches any run of characters within a single path segment.
const ANY_NAME: &str = r"[^/\\]*";
/// Matches a single character within a path segment.
const ANY_CHAR: &str = r"[^/\\]";

/// A glob pattern that could not be compiled.
#[derive(Debug, Error)]
#[error("invalid pattern `{pattern}`")]
pub struct PatternError {
    pattern: String,
    #[source]
    source: regex::Error,
}

/// A compiled glob pattern, anchored at both ends of the path.
///
/// The supported wildcards are:
///
/// - `**/`: any number of directories, including none. `\` works as separator as well.
/// - `*`: any number of characters other than a path separator.
/// - `?`: exactly one character other than a path separator.
///
/// Everything else is matched literally.
#[derive(Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
}

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let regex = Regex::new(&translate(pattern)).map_err(|source| PatternError {
            pattern: pattern.to_owned(),
            source,
        })?;

        Ok(Self {
            pattern: pattern.to_owned(),
            regex,
        })
    }

    /// Returns `true` if the whole of `path` matches this pattern.
    pub fn is_match(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Debug for Glob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Glob").field(&self.pattern).finish()
    }
}

/// Translates a glob pattern into an anchored regular expression.
fn translate(pattern: &str) -> String {
    let mut regex = String::with_capacity(pattern.len() * 2 + 2);
    regex.push('^');

    let mut rest = pattern;
    while let Some(c) = rest.chars().next() {
        if let Some(tail) = rest
            .strip_prefix("**/")
            .or_else(|| rest.strip_prefix("**\\"))
        {
            regex.push_str(ANY_DIRS);
            rest = tail;
            continue;
        }

        match c {
            '*' => regex.push_str(ANY_NAME),
            '?' => regex.push_str(ANY_CHAR),
            c => {
                let mut buf = [0; 4];
                regex.push_str(&regex::escape(c.encode_utf8(&mut buf)));
            }
        }
        rest = &rest[c.len_utf8()..];
    }

    regex.push('$');
    regex
}

#[cfg(test)]
mod tests {
    use super::*;

    fn glob(pattern: &str) -> Glob {
        Glob::new(pattern).unwrap()
    }

    #[test]
    fn test_recursive_directories() {
        let g = glob("/tf2/sound/**/*");
        assert!(g.is_match("/tf2/sound/c.wav"));
        assert!(g.is_match("/tf2/sound/a/c.wav"));
        assert!(g.is_match("/tf2/sound/a/b/c.wav"));
        assert!(!g.is_match("/tf2/soundx/c.wav"));
        assert!(!g.is_match("/tf2/c.wav"));
    }

    #[test]
    fn test_star_stays_in_segment() {
        let g = glob("/tf2/*");
        assert!(g.is_match("/tf2/a.txt"));
        assert!(g.is_match("/tf2/"));
        assert!(!g.is_match("/tf2/maps/a.bsp"));
        assert!(!g.is_match("/tf2\\maps"));
    }

    #[test]
    fn test_question_mark() {
        let g = glob("/file?.txt");
        assert!(g.is_match("/file1.txt"));
        assert!(!g.is_match("/file.txt"));
        assert!(!g.is_match("/file12.txt"));
        assert!(!g.is_match("/file/.txt"));
    }

    #[test]
    fn test_literal_characters() {
        let g = glob("/a.(b)+[c]$");
        assert!(g.is_match("/a.(b)+[c]$"));
        assert!(!g.is_match("/aX(b)+[c]$"));
        assert!(!g.is_match("/a.bb[c]$"));
    }

    #[test]
    fn test_anchored() {
        let g = glob("/maps/*.bsp");
        assert!(g.is_match("/maps/de_dust.bsp"));
        assert!(!g.is_match("/x/maps/de_dust.bsp"));
        assert!(!g.is_match("/maps/de_dust.bsp.bz2"));
    }

    #[test]
    fn test_backslash_separators() {
        let g = glob("\\root\\**\\*.txt");
        assert!(g.is_match("\\root\\a.txt"));
        assert!(g.is_match("\\root\\a\\b.txt"));
        assert!(g.is_match("\\root\\a/b.txt"));
    }

    #[test]
    fn test_double_star_without_separator() {
        // Without a trailing separator, `**` is just two single-segment wildcards.
        let g = glob("/a**");
        assert!(g.is_match("/abc"));
        assert!(!g.is_match("/a/bc"));
    }

    #[test]
    fn test_catch_all() {
        let g = glob("/**/*");
        assert!(g.is_match("/a"));
        assert!(g.is_match("/a/b/c"));
        assert!(!g.is_match("a"));
    }
}
