//! Glob-style matching shared by rule selection and sanitization.
//!
//! Two modes exist. [`matches`] is an anchored, case-sensitive string match in
//! which `*` stands for any run of characters (slashes included); rules use it
//! against story keys. [`matches_path`] works on already-split segments: a
//! `*` segment matches exactly one segment and `**` matches zero or more
//! consecutive segments; the sanitization filter uses it on dot paths.

/// Anchored wildcard match of `candidate` against `pattern`.
pub fn matches(pattern: &str, candidate: &str) -> bool {
    WildcardPattern::new(pattern).is_match(candidate)
}

/// Segment-wise match with `*` (one segment) and `**` (any number of segments).
pub fn matches_path<S, P>(path: &[S], pattern: &[P]) -> bool
where
    S: AsRef<str>,
    P: AsRef<str>,
{
    let Some((head, tail)) = pattern.split_first() else {
        return path.is_empty();
    };

    if head.as_ref() == "**" {
        if tail.is_empty() {
            return true;
        }

        return (0..=path.len()).any(|split| matches_path(&path[split..], tail));
    }

    let Some((path_head, path_tail)) = path.split_first() else {
        return false;
    };

    (head.as_ref() == "*" || head.as_ref() == path_head.as_ref()) && matches_path(path_tail, tail)
}

/// Convenience wrapper over [`matches_path`] for dot-delimited strings.
pub fn matches_dot_path(path: &str, pattern: &str) -> bool {
    let path: Vec<&str> = path.split('.').collect();
    let pattern: Vec<&str> = pattern.split('.').collect();
    matches_path(&path, &pattern)
}

/// A `*` wildcard pattern pre-split on its wildcards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WildcardPattern {
    source: String,
    literals: Vec<String>,
}

impl WildcardPattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            source: pattern.to_string(),
            literals: pattern.split('*').map(str::to_owned).collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, candidate: &str) -> bool {
        let Some((first, rest)) = self.literals.split_first() else {
            return candidate.is_empty();
        };
        let Some((last, middle)) = rest.split_last() else {
            return candidate == first;
        };
        let Some(mut remaining) = candidate.strip_prefix(first.as_str()) else {
            return false;
        };

        // Leftmost placement of each inner literal leaves the most room for the rest.
        for literal in middle.iter().filter(|literal| !literal.is_empty()) {
            match remaining.find(literal.as_str()) {
                Some(index) => remaining = &remaining[index + literal.len()..],
                None => return false,
            }
        }

        remaining.ends_with(last.as_str())
    }
}

/// A dot-delimited path pattern such as `items.*.body` or `**.html`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPattern {
    source: String,
    segments: Vec<String>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Self {
        Self {
            source: pattern.to_string(),
            segments: pattern.split('.').map(str::to_owned).collect(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn matches<S: AsRef<str>>(&self, path: &[S]) -> bool {
        matches_path(path, &self.segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_patterns_are_anchored() {
        assert!(matches("astro/card", "astro/card"));
        assert!(!matches("astro/card", "astro/card/default"));
        assert!(!matches("astro/card", "x/astro/card"));
        assert!(!matches("Astro/Card", "astro/card"));
    }

    #[test]
    fn star_matches_any_run_including_slashes() {
        assert!(matches("astro/*", "astro/card/default"));
        assert!(matches("*", ""));
        assert!(matches("*--primary", "button--primary"));
        assert!(matches("/story/*/default", "/story/astro/card/default"));
        assert!(!matches("astro/*/default", "astro/default"));
    }

    #[test]
    fn literal_segments_do_not_overlap() {
        assert!(!matches("a*a", "a"));
        assert!(matches("a*a", "aa"));
        assert!(!matches("*b*b", "b"));
        assert!(matches("*b*b", "bb"));
        assert!(matches("x*y*z", "x-y-y-z"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(matches("a.b(c)", "a.b(c)"));
        assert!(!matches("a.b", "axb"));
    }

    #[test]
    fn double_star_spans_segments() {
        assert!(matches_path(&["a", "b", "c"], &["a", "**", "c"]));
        assert!(matches_path(&["a", "c"], &["a", "**", "c"]));
        assert!(matches_path(&["a", "x", "y", "c"], &["a", "**", "c"]));
        assert!(!matches_path(&["a", "x", "d"], &["a", "**", "c"]));
    }

    #[test]
    fn single_star_spans_exactly_one_segment() {
        assert!(!matches_path(&["a", "b"], &["a", "*", "c"]));
        assert!(matches_path(&["a", "b", "c"], &["a", "*", "c"]));
        assert!(!matches_path(&["a", "c"], &["a", "*", "c"]));
    }

    #[test]
    fn trailing_double_star_matches_any_suffix() {
        assert!(matches_path(&["a"], &["a", "**"]));
        assert!(matches_path(&["a", "b", "c"], &["a", "**"]));
        assert!(matches_path(&["anything"], &["**"]));
    }

    #[test]
    fn empty_pattern_matches_only_empty_path() {
        let empty: [&str; 0] = [];
        assert!(matches_path(&empty, &empty));
        assert!(!matches_path(&["a"], &empty));
    }

    #[test]
    fn dot_path_helpers_split_on_dots() {
        assert!(matches_dot_path("items.0.body", "items.*.body"));
        assert!(matches_dot_path("content", "**"));
        assert!(!matches_dot_path("items.0.title", "items.*.body"));

        let pattern = PathPattern::parse("**.html");
        assert_eq!(pattern.segments(), ["**", "html"]);
        assert!(pattern.matches(&["deep", "nested", "html"]));
        assert!(pattern.matches(&["html"]));
        assert_eq!(pattern.as_str(), "**.html");
    }
}
