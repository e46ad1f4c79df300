//! Path pattern matching for policy resolution.
//!
//! Supports exact paths, prefixes (`/api/*`, `/api/**`) and general globs
//! with `*` (any run of characters, including `/`) and `?` (one character).

use crate::error::PolicyError;

/// Compiled path pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathPattern {
    Exact(String),
    /// Prefix without the trailing `/*` or `/**`
    Prefix(String),
    Glob(String),
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, PolicyError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(PolicyError::InvalidPattern(pattern.to_string()));
        }

        let prefix = pattern
            .strip_suffix("/**")
            .or_else(|| pattern.strip_suffix("/*"));
        if let Some(prefix) = prefix {
            if !has_wildcard(prefix) {
                return Ok(Self::Prefix(prefix.to_string()));
            }
        }

        if has_wildcard(pattern) {
            Ok(Self::Glob(pattern.to_string()))
        } else {
            Ok(Self::Exact(pattern.to_string()))
        }
    }

    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Exact(exact) => path == exact,
            Self::Prefix(prefix) if prefix.is_empty() => path.starts_with('/'),
            Self::Prefix(prefix) => {
                path == prefix
                    || path
                        .strip_prefix(prefix.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            }
            Self::Glob(glob) => glob_match(glob, path),
        }
    }

    /// Ordering weight within one origin: exact paths first, then patterns
    /// with more literal segments.
    pub fn specificity(&self) -> u32 {
        match self {
            Self::Exact(exact) => 1000 + 10 * segment_count(exact),
            Self::Prefix(prefix) => 10 * segment_count(prefix) + 1,
            Self::Glob(glob) => {
                let (literal, wildcard) = glob
                    .split('/')
                    .filter(|s| !s.is_empty())
                    .fold((0, 0), |(l, w), s| {
                        if has_wildcard(s) {
                            (l, w + 1)
                        } else {
                            (l + 1, w)
                        }
                    });
                10 * literal + wildcard
            }
        }
    }
}

fn has_wildcard(s: &str) -> bool {
    s.contains(['*', '?'])
}

fn segment_count(path: &str) -> u32 {
    path.split('/').filter(|s| !s.is_empty()).count() as u32
}

/// Greedy glob match with single-star backtracking.
///
/// On mismatch the matcher returns to the last `*` and lets it swallow one
/// more character of input.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut resume = 0usize;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            resume = ti;
            pi += 1;
        } else if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            resume += 1;
            ti = resume;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kinds() {
        assert_eq!(PathPattern::parse("/login").unwrap(), PathPattern::Exact("/login".into()));
        assert_eq!(PathPattern::parse("/api/*").unwrap(), PathPattern::Prefix("/api".into()));
        assert_eq!(PathPattern::parse("/api/**").unwrap(), PathPattern::Prefix("/api".into()));
        assert_eq!(
            PathPattern::parse("/*/admin").unwrap(),
            PathPattern::Glob("/*/admin".into())
        );
        assert!(PathPattern::parse("  ").is_err());
    }

    #[test]
    fn test_prefix_matching() {
        let api = PathPattern::parse("/api/*").unwrap();
        assert!(api.matches("/api"));
        assert!(api.matches("/api/users"));
        assert!(api.matches("/api/users/42"));
        assert!(!api.matches("/apiary"));
        assert!(!api.matches("/static/api"));

        let root = PathPattern::parse("/**").unwrap();
        assert!(root.matches("/anything/at/all"));
    }

    #[test]
    fn test_glob_matching() {
        assert!(glob_match("/*.php", "/wp/admin.php"));
        assert!(glob_match("/user/?/profile", "/user/7/profile"));
        assert!(!glob_match("/user/?/profile", "/user/77/profile"));
        assert!(glob_match("*a*b", "xaxxb"));
        assert!(!glob_match("*a*b", "xaxxc"));
        assert!(glob_match("**", ""));
        assert!(glob_match("/a*b*c", "/aXbYbZc"));
        assert!(!glob_match("/a", "/ab"));
    }

    #[test]
    fn test_star_in_path_is_matched_as_wildcard() {
        assert!(glob_match("/a*", "/a*b"));
        assert!(glob_match("/a*b", "/a*xb"));
        assert!(glob_match("*", "*"));
    }

    #[test]
    fn test_specificity_order() {
        let exact = PathPattern::parse("/api/login").unwrap();
        let deep = PathPattern::parse("/api/v1/*").unwrap();
        let shallow = PathPattern::parse("/api/*").unwrap();
        let glob = PathPattern::parse("/*/v1/*.json").unwrap();

        assert!(exact.specificity() > deep.specificity());
        assert!(deep.specificity() > shallow.specificity());
        assert!(deep.specificity() > glob.specificity());
    }
}
