//! Subtopic patterns
//!
//! A subtopic partitions one destination into addressable channels. Segments
//! are split on a per-destination separator; `*` matches exactly one segment
//! and a trailing `**` matches zero or more trailing segments. Wildcards are
//! only meaningful when subscribing.

use std::fmt;

use crate::protocol::MessagingError;

/// Matches exactly one segment
pub const SINGLE_WILDCARD: &str = "*";
/// Matches zero or more trailing segments (last segment only)
pub const MULTI_WILDCARD: &str = "**";

/// Subtopic validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubtopicError {
    /// Separator is empty or contains the wildcard character
    InvalidSeparator(String),
    /// Leading, trailing or doubled separator
    EmptySegment(String),
    /// `*` mixed with other characters, or `**` before the last segment
    MisplacedWildcard(String),
}

impl fmt::Display for SubtopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSeparator(sep) => write!(f, "invalid subtopic separator '{}'", sep),
            Self::EmptySegment(s) => write!(f, "subtopic '{}' has an empty segment", s),
            Self::MisplacedWildcard(s) => write!(f, "subtopic '{}' has a misplaced wildcard", s),
        }
    }
}

impl std::error::Error for SubtopicError {}

impl From<SubtopicError> for MessagingError {
    fn from(e: SubtopicError) -> Self {
        match e {
            SubtopicError::InvalidSeparator(s)
            | SubtopicError::EmptySegment(s)
            | SubtopicError::MisplacedWildcard(s) => MessagingError::InvalidSubtopic(s),
        }
    }
}

/// Check a separator is usable
pub fn validate_separator(separator: &str) -> Result<(), SubtopicError> {
    if separator.is_empty() || separator.contains('*') {
        return Err(SubtopicError::InvalidSeparator(separator.to_string()));
    }
    Ok(())
}

/// A parsed subtopic pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subtopic {
    pattern: String,
    separator: String,
    has_wildcard: bool,
}

impl Subtopic {
    /// Parse and validate `pattern`; the empty pattern denotes "no subtopic"
    pub fn new(pattern: &str, separator: &str) -> Result<Self, SubtopicError> {
        validate_separator(separator)?;

        let mut has_wildcard = false;
        if !pattern.is_empty() {
            let mut segments = pattern.split(separator).peekable();
            while let Some(segment) = segments.next() {
                let is_last = segments.peek().is_none();
                if segment.is_empty() {
                    return Err(SubtopicError::EmptySegment(pattern.to_string()));
                }
                if !segment.contains('*') {
                    continue;
                }
                match segment {
                    SINGLE_WILDCARD => has_wildcard = true,
                    MULTI_WILDCARD if is_last => has_wildcard = true,
                    _ => return Err(SubtopicError::MisplacedWildcard(pattern.to_string())),
                }
            }
        }

        Ok(Self {
            pattern: pattern.to_string(),
            separator: separator.to_string(),
            has_wildcard,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    /// True for the default channel
    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    /// True if any segment is `*` or `**`
    pub fn contains_wildcard(&self) -> bool {
        self.has_wildcard
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        let pattern = if self.pattern.is_empty() {
            None
        } else {
            Some(self.pattern.split(self.separator.as_str()))
        };
        pattern.into_iter().flatten()
    }

    /// Whether a concrete subtopic falls under this pattern
    pub fn matches(&self, candidate: &str) -> bool {
        if self.pattern.is_empty() || candidate.is_empty() {
            return self.pattern.is_empty() && candidate.is_empty();
        }

        let mut pattern = self.pattern.split(self.separator.as_str());
        let mut candidate = candidate.split(self.separator.as_str());
        loop {
            match (pattern.next(), candidate.next()) {
                (Some(MULTI_WILDCARD), _) => return true,
                (Some(SINGLE_WILDCARD), Some(_)) => {}
                (Some(p), Some(c)) if p == c => {}
                (None, None) => return true,
                _ => return false,
            }
        }
    }
}

impl fmt::Display for Subtopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    #[test_case("a/*", "a/b", true ; "single wildcard one segment")]
    #[test_case("a/*", "a/b/c", false ; "single wildcard stops at one")]
    #[test_case("a/*", "a", false ; "single wildcard needs a segment")]
    #[test_case("a/**", "a/b", true ; "multi wildcard one segment")]
    #[test_case("a/**", "a/b/c", true ; "multi wildcard many segments")]
    #[test_case("a/**", "a", true ; "multi wildcard zero segments")]
    #[test_case("*/b", "a/b", true ; "leading single wildcard")]
    #[test_case("a/b", "a/b", true ; "exact")]
    #[test_case("a/b", "a/c", false ; "exact mismatch")]
    #[test_case("a/b", "a/b/c", false ; "candidate longer")]
    #[test_case("a/b/c", "a/b", false ; "candidate shorter")]
    #[test_case("**", "x/y/z", true ; "match everything")]
    fn test_matches(pattern: &str, candidate: &str, expected: bool) {
        let subtopic = Subtopic::new(pattern, "/").unwrap();
        assert_eq!(subtopic.matches(candidate), expected);
    }

    #[test]
    fn test_custom_separator() {
        let subtopic = Subtopic::new("news.*", ".").unwrap();
        assert!(subtopic.matches("news.sports"));
        assert!(!subtopic.matches("weather.today"));
        // "/" is an ordinary character under a "." separator
        assert!(subtopic.matches("news.a/b"));

        let subtopic = Subtopic::new("a::**", "::").unwrap();
        assert!(subtopic.matches("a::b::c"));
    }

    #[test]
    fn test_empty_pattern_is_default_channel() {
        let subtopic = Subtopic::new("", ".").unwrap();
        assert!(subtopic.is_empty());
        assert!(!subtopic.contains_wildcard());
        assert!(subtopic.matches(""));
        assert!(!subtopic.matches("a"));
        assert_eq!(subtopic.segments().count(), 0);
        assert!(!Subtopic::new("**", ".").unwrap().matches(""));
    }

    #[test]
    fn test_contains_wildcard() {
        assert!(Subtopic::new("a.*", ".").unwrap().contains_wildcard());
        assert!(Subtopic::new("a.**", ".").unwrap().contains_wildcard());
        assert!(!Subtopic::new("a.b", ".").unwrap().contains_wildcard());
    }

    #[test_case("a..b" ; "doubled separator")]
    #[test_case(".a" ; "leading separator")]
    #[test_case("a." ; "trailing separator")]
    fn test_rejects_empty_segments(pattern: &str) {
        assert!(matches!(
            Subtopic::new(pattern, "."),
            Err(SubtopicError::EmptySegment(_))
        ));
    }

    #[test_case("a.b*" ; "wildcard inside segment")]
    #[test_case("a.**.b" ; "multi wildcard not last")]
    #[test_case("***" ; "triple star")]
    fn test_rejects_misplaced_wildcards(pattern: &str) {
        assert!(matches!(
            Subtopic::new(pattern, "."),
            Err(SubtopicError::MisplacedWildcard(_))
        ));
    }

    #[test]
    fn test_rejects_bad_separator() {
        assert!(Subtopic::new("a", "").is_err());
        assert!(Subtopic::new("a", "*").is_err());
    }

    proptest! {
        #[test]
        fn prop_literal_pattern_matches_itself(segments in prop::collection::vec("[a-z0-9]{1,6}", 1..6)) {
            let subtopic = segments.join(".");
            let pattern = Subtopic::new(&subtopic, ".").unwrap();
            prop_assert!(pattern.matches(&subtopic));
            prop_assert!(!pattern.contains_wildcard());
        }

        #[test]
        fn prop_multi_wildcard_matches_any_extension(
            prefix in prop::collection::vec("[a-z]{1,4}", 1..4),
            suffix in prop::collection::vec("[a-z]{1,4}", 0..4),
        ) {
            let pattern = Subtopic::new(&format!("{}.**", prefix.join(".")), ".").unwrap();
            let candidate = prefix.iter().chain(suffix.iter()).cloned().collect::<Vec<_>>().join(".");
            prop_assert!(pattern.matches(&candidate));
        }

        #[test]
        fn prop_single_wildcard_replaces_one_segment(
            segments in prop::collection::vec("[a-z]{1,4}", 1..6),
            index in 0usize..6,
        ) {
            let index = index % segments.len();
            let mut pattern_segments = segments.clone();
            pattern_segments[index] = "*".to_string();
            let pattern = Subtopic::new(&pattern_segments.join("."), ".").unwrap();
            prop_assert!(pattern.matches(&segments.join(".")));
            let longer = format!("{}.extra", segments.join("."));
            prop_assert!(!pattern.matches(&longer));
        }
    }
}
