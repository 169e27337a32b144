//! Path pattern parsing and matching.
//!
//! Five pattern kinds are supported (spec'd in the routing module docs):
//! exact, prefix, parameterized template, glob, and regex. Bare pattern
//! strings are classified by shape; an explicit `exact:` / `prefix:` /
//! `glob:` / `regex:` marker overrides classification.
//!
//! Trie-eligible patterns (everything except arbitrary regex and globs with
//! interior `**`) produce a canonical trie path where a parameter segment is
//! the `PARAM_MARKER` character and a catch-all tail is `CATCH_ALL_MARKER`.
use regex::Regex;

use super::context::PathParams;

/// Reserved marker for "one segment binds here" in a canonical trie path.
pub const PARAM_MARKER: char = '\u{0}';
/// Reserved marker for "the remainder binds here" in a canonical trie path.
pub const CATCH_ALL_MARKER: char = '\u{1}';

/// Name under which a `/**` tail binds the remainder.
pub const CATCH_ALL_PARAM: &str = "*";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PatternError {
    #[error("path must start with '/': {0}")]
    MissingLeadingSlash(String),
    #[error("placeholder `{0}` bound more than once")]
    DuplicateParam(String),
    #[error("invalid segment `{0}` in parameterized path")]
    InvalidSegment(String),
    #[error("`**` is only allowed as the final segment: {0}")]
    MisplacedCatchAll(String),
    #[error("invalid regex: {0}")]
    InvalidRegex(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Param(String),
    CatchAll,
}

/// A parsed path pattern. Matching yields the path-parameter bindings.
#[derive(Debug, Clone)]
pub enum PathPattern {
    Exact(String),
    /// Normalized to end with `/`; matches everything under the prefix.
    Prefix(String),
    Parameterized {
        source: String,
        segments: Vec<Segment>,
    },
    Glob {
        source: String,
        regex: Regex,
    },
    Regex {
        source: String,
        regex: Regex,
    },
}

impl PathPattern {
    /// Parse a pattern string, classifying bare strings by shape.
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if let Some(rest) = pattern.strip_prefix("regex:") {
            let regex = Regex::new(rest)
                .map_err(|e| PatternError::InvalidRegex(e.to_string()))?;
            return Ok(PathPattern::Regex {
                source: rest.to_string(),
                regex,
            });
        }
        if let Some(rest) = pattern.strip_prefix("glob:") {
            return Self::parse_glob(rest);
        }
        if let Some(rest) = pattern.strip_prefix("prefix:") {
            return Self::parse_prefix(rest);
        }
        if let Some(rest) = pattern.strip_prefix("exact:") {
            return Self::parse_exact(rest);
        }

        if pattern.split('/').any(is_param_segment) {
            return Self::parse_template(pattern);
        }
        if pattern.contains('*') {
            return Self::parse_glob(pattern);
        }
        Self::parse_exact(pattern)
    }

    fn parse_exact(path: &str) -> Result<Self, PatternError> {
        if !path.starts_with('/') {
            return Err(PatternError::MissingLeadingSlash(path.to_string()));
        }
        Ok(PathPattern::Exact(path.to_string()))
    }

    fn parse_prefix(path: &str) -> Result<Self, PatternError> {
        if !path.starts_with('/') {
            return Err(PatternError::MissingLeadingSlash(path.to_string()));
        }
        let mut normalized = path.to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        Ok(PathPattern::Prefix(normalized))
    }

    fn parse_template(path: &str) -> Result<Self, PatternError> {
        if !path.starts_with('/') {
            return Err(PatternError::MissingLeadingSlash(path.to_string()));
        }
        let raw: Vec<&str> = path[1..].split('/').collect();
        let mut segments = Vec::with_capacity(raw.len());
        let mut names: Vec<&str> = Vec::new();
        for (i, seg) in raw.iter().enumerate() {
            if *seg == "**" {
                if i != raw.len() - 1 {
                    return Err(PatternError::MisplacedCatchAll(path.to_string()));
                }
                segments.push(Segment::CatchAll);
            } else if let Some(name) = param_name(seg) {
                if names.contains(&name) {
                    return Err(PatternError::DuplicateParam(name.to_string()));
                }
                names.push(name);
                segments.push(Segment::Param(name.to_string()));
            } else if seg.contains('*') || seg.contains('{') || seg.contains('}') {
                return Err(PatternError::InvalidSegment(seg.to_string()));
            } else {
                segments.push(Segment::Literal(seg.to_string()));
            }
        }
        Ok(PathPattern::Parameterized {
            source: path.to_string(),
            segments,
        })
    }

    fn parse_glob(glob: &str) -> Result<Self, PatternError> {
        // A glob without a leading slash matches as a suffix anywhere.
        let glob = if glob.starts_with('/') {
            glob.to_string()
        } else {
            format!("/**/{glob}")
        };
        if glob.contains("**") {
            // `**` may only appear as a whole segment
            for seg in glob[1..].split('/') {
                if seg.contains("**") && seg != "**" {
                    return Err(PatternError::InvalidSegment(seg.to_string()));
                }
            }
        }
        let regex = Regex::new(&glob_to_regex(&glob))
            .map_err(|e| PatternError::InvalidRegex(e.to_string()))?;
        Ok(PathPattern::Glob {
            source: glob,
            regex,
        })
    }

    /// Canonical source form, unique per pattern kind + path.
    pub fn canonical(&self) -> String {
        match self {
            PathPattern::Exact(p) => format!("exact:{p}"),
            PathPattern::Prefix(p) => format!("prefix:{p}"),
            PathPattern::Parameterized { source, .. } => format!("template:{source}"),
            PathPattern::Glob { source, .. } => format!("glob:{source}"),
            PathPattern::Regex { source, .. } => format!("regex:{source}"),
        }
    }

    /// The exact path this pattern describes, when it describes exactly one.
    pub fn exact_path(&self) -> Option<&str> {
        match self {
            PathPattern::Exact(p) => Some(p),
            _ => None,
        }
    }

    /// Canonical trie path, or `None` when the pattern is not trie-eligible.
    ///
    /// Arbitrary regexes and globs with wildcards other than whole-segment
    /// `*` / trailing `**` fall back to the sequential router.
    pub fn trie_path(&self) -> Option<String> {
        match self {
            PathPattern::Exact(p) => Some(p.clone()),
            PathPattern::Prefix(p) => {
                let mut out = p.clone();
                out.push(CATCH_ALL_MARKER);
                Some(out)
            }
            PathPattern::Parameterized { segments, .. } => {
                let mut out = String::new();
                for seg in segments {
                    out.push('/');
                    match seg {
                        Segment::Literal(lit) => out.push_str(lit),
                        Segment::Param(_) => out.push(PARAM_MARKER),
                        Segment::CatchAll => out.push(CATCH_ALL_MARKER),
                    }
                }
                Some(out)
            }
            PathPattern::Glob { source, .. } => {
                let mut out = String::new();
                let segs: Vec<&str> = source[1..].split('/').collect();
                for (i, seg) in segs.iter().enumerate() {
                    out.push('/');
                    if *seg == "**" {
                        if i != segs.len() - 1 {
                            return None;
                        }
                        out.push(CATCH_ALL_MARKER);
                    } else if *seg == "*" {
                        out.push(PARAM_MARKER);
                    } else if seg.contains('*') {
                        return None;
                    } else {
                        out.push_str(seg);
                    }
                }
                Some(out)
            }
            PathPattern::Regex { .. } => None,
        }
    }

    /// Match a (percent-decoded) request path, yielding parameter bindings.
    pub fn match_path(&self, path: &str) -> Option<PathParams> {
        match self {
            PathPattern::Exact(p) => (path == p).then(PathParams::default),
            PathPattern::Prefix(p) => path.starts_with(p.as_str()).then(PathParams::default),
            PathPattern::Parameterized { segments, .. } => match_template(segments, path),
            PathPattern::Glob { regex, .. } => {
                let caps = regex.captures(path)?;
                let mut params = PathParams::default();
                for (i, m) in caps.iter().skip(1).enumerate() {
                    if let Some(m) = m {
                        params.insert(i.to_string(), m.as_str().to_string());
                    }
                }
                Some(params)
            }
            PathPattern::Regex { regex, .. } => {
                let caps = regex.captures(path)?;
                let mut params = PathParams::default();
                for name in regex.capture_names().flatten() {
                    if let Some(m) = caps.name(name) {
                        params.insert(name.to_string(), m.as_str().to_string());
                    }
                }
                Some(params)
            }
        }
    }

    /// Parameter names this pattern binds, for duplicate detection and
    /// handler parameter validation.
    pub fn param_names(&self) -> Vec<String> {
        match self {
            PathPattern::Parameterized { segments, .. } => segments
                .iter()
                .filter_map(|s| match s {
                    Segment::Param(name) => Some(name.clone()),
                    Segment::CatchAll => Some(CATCH_ALL_PARAM.to_string()),
                    Segment::Literal(_) => None,
                })
                .collect(),
            PathPattern::Regex { regex, .. } => regex
                .capture_names()
                .flatten()
                .map(|s| s.to_string())
                .collect(),
            _ => Vec::new(),
        }
    }
}

fn is_param_segment(seg: &str) -> bool {
    param_name(seg).is_some()
}

fn param_name(seg: &str) -> Option<&str> {
    if seg.len() > 2 && seg.starts_with('{') && seg.ends_with('}') {
        Some(&seg[1..seg.len() - 1])
    } else if seg.len() > 1 && seg.starts_with(':') {
        Some(&seg[1..])
    } else {
        None
    }
}

fn match_template(segments: &[Segment], path: &str) -> Option<PathParams> {
    if !path.starts_with('/') {
        return None;
    }
    let mut params = PathParams::default();
    let mut pos = 0usize;
    for seg in segments {
        if path.as_bytes().get(pos) != Some(&b'/') {
            return None;
        }
        pos += 1;
        let rest = &path[pos..];
        match seg {
            Segment::Literal(lit) => {
                if !rest.starts_with(lit.as_str()) {
                    return None;
                }
                let end = pos + lit.len();
                match path.as_bytes().get(end) {
                    None | Some(&b'/') => pos = end,
                    _ => return None,
                }
            }
            Segment::Param(name) => {
                let len = rest.find('/').unwrap_or(rest.len());
                if len == 0 {
                    return None;
                }
                params.insert(name.clone(), rest[..len].to_string());
                pos += len;
            }
            Segment::CatchAll => {
                params.insert(CATCH_ALL_PARAM.to_string(), rest.to_string());
                pos = path.len();
            }
        }
    }
    (pos == path.len()).then_some(params)
}

fn glob_to_regex(glob: &str) -> String {
    let chars: Vec<char> = glob.chars().collect();
    let mut out = String::from("^");
    let mut group = 0usize;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                if chars.get(i + 2) == Some(&'/') {
                    // `**/` spans zero or more whole segments
                    out.push_str(&format!("(?P<g{group}>(?:[^/]+/)*)"));
                    i += 3;
                } else {
                    out.push_str(&format!("(?P<g{group}>.*)"));
                    i += 2;
                }
                group += 1;
            }
            '*' => {
                out.push_str(&format!("(?P<g{group}>[^/]*)"));
                group += 1;
                i += 1;
            }
            c => {
                out.push_str(&regex::escape(&c.to_string()));
                i += 1;
            }
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> PathParams {
        let mut p = PathParams::default();
        for (k, v) in pairs {
            p.insert(k.to_string(), v.to_string());
        }
        p
    }

    #[test]
    fn classify_bare_patterns() {
        assert!(matches!(
            PathPattern::parse("/users").unwrap(),
            PathPattern::Exact(_)
        ));
        assert!(matches!(
            PathPattern::parse("/users/{id}").unwrap(),
            PathPattern::Parameterized { .. }
        ));
        assert!(matches!(
            PathPattern::parse("/users/:id").unwrap(),
            PathPattern::Parameterized { .. }
        ));
        assert!(matches!(
            PathPattern::parse("/files/*.txt").unwrap(),
            PathPattern::Glob { .. }
        ));
        assert!(matches!(
            PathPattern::parse("regex:^/r/(?P<name>[a-z]+)$").unwrap(),
            PathPattern::Regex { .. }
        ));
    }

    #[test]
    fn prefix_normalizes_trailing_slash() {
        let p = PathPattern::parse("prefix:/static").unwrap();
        match &p {
            PathPattern::Prefix(s) => assert_eq!(s, "/static/"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(p.match_path("/static/css/app.css").is_some());
        assert!(p.match_path("/static").is_none());
    }

    #[test]
    fn template_binds_segments() {
        let p = PathPattern::parse("/users/{id}/posts/{post}").unwrap();
        assert_eq!(
            p.match_path("/users/42/posts/7"),
            Some(params(&[("id", "42"), ("post", "7")]))
        );
        assert_eq!(p.match_path("/users/42"), None);
        assert_eq!(p.match_path("/users//posts/7"), None);
    }

    #[test]
    fn template_catch_all_binds_remainder() {
        let p = PathPattern::parse("/repos/{owner}/**").unwrap();
        assert_eq!(
            p.match_path("/repos/octo/tree/main/src"),
            Some(params(&[("owner", "octo"), ("*", "tree/main/src")]))
        );
        assert_eq!(p.match_path("/repos/octo/"), Some(params(&[("owner", "octo"), ("*", "")])));
        assert_eq!(p.match_path("/repos/octo"), None);
    }

    #[test]
    fn bare_double_star_is_a_glob() {
        let p = PathPattern::parse("/api/**").unwrap();
        assert!(matches!(p, PathPattern::Glob { .. }));
        let m = p.match_path("/api/users/1").unwrap();
        assert_eq!(m.get("0"), Some("users/1"));
        assert!(p.match_path("/api").is_none());
    }

    #[test]
    fn duplicate_placeholder_rejected() {
        assert_eq!(
            PathPattern::parse("/a/{x}/b/{x}"),
            Err(PatternError::DuplicateParam("x".to_string()))
        );
    }

    #[test]
    fn misplaced_catch_all_rejected() {
        assert_eq!(
            PathPattern::parse("/a/**/b"),
            Err(PatternError::MisplacedCatchAll("/a/**/b".to_string()))
        );
    }

    #[test]
    fn glob_matches_single_and_many_segments() {
        let p = PathPattern::parse("/files/*/data/**").unwrap();
        let m = p.match_path("/files/abc/data/x/y").unwrap();
        assert_eq!(m.get("0"), Some("abc"));
        assert_eq!(m.get("1"), Some("x/y"));
        assert!(p.match_path("/files/a/b/data/x").is_none());
    }

    #[test]
    fn relative_glob_matches_as_suffix() {
        let p = PathPattern::parse("glob:*.ico").unwrap();
        assert!(p.match_path("/favicon.ico").is_some());
        assert!(p.match_path("/deep/nested/favicon.ico").is_some());
        assert!(p.match_path("/favicon.png").is_none());
    }

    #[test]
    fn regex_named_captures_become_params() {
        let p = PathPattern::parse("regex:^/repos/(?P<owner>[^/]+)/(?P<repo>[^/]+)$").unwrap();
        assert_eq!(
            p.match_path("/repos/rust-lang/rust"),
            Some(params(&[("owner", "rust-lang"), ("repo", "rust")]))
        );
    }

    #[test]
    fn trie_eligibility() {
        assert_eq!(
            PathPattern::parse("/users/{id}").unwrap().trie_path(),
            Some(format!("/users/{PARAM_MARKER}"))
        );
        assert_eq!(
            PathPattern::parse("/api/**").unwrap().trie_path(),
            Some(format!("/api/{CATCH_ALL_MARKER}"))
        );
        assert_eq!(
            PathPattern::parse("prefix:/static").unwrap().trie_path(),
            Some(format!("/static/{CATCH_ALL_MARKER}"))
        );
        // interior ** and partial-segment wildcards are sequential-only
        assert_eq!(PathPattern::parse("/files/*.txt").unwrap().trie_path(), None);
        assert_eq!(
            PathPattern::parse("regex:^/x/(?P<a>.+)$").unwrap().trie_path(),
            None
        );
    }
}
