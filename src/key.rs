//! Structured cache keys and wildcard invalidation patterns.
//!
//! Keys are hierarchical, colon-separated and have exactly one canonical
//! string form: `namespace:segment:segment` (e.g. `chat:123:messages:0`).
//! All lookups and pattern matches go through this form, so a key built with
//! [`CacheKey::build`] and one parsed from its own `Display` output always
//! collide.
//!
//! Patterns support `*` as "one or more whole segments":
//!
//! ```
//! use cache_sync::KeyPattern;
//!
//! let pattern = KeyPattern::parse("chat:*:messages:*");
//! assert!(pattern.matches("chat:1:messages:0"));
//! assert!(!pattern.matches("chat:1:members"));
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Segment separator in the canonical key form.
pub const KEY_SEPARATOR: char = ':';

/// Wildcard segment in patterns.
pub const WILDCARD: &str = "*";

/// A validated, hierarchical cache key.
///
/// Invariants: at least two non-empty segments (namespace plus one), no
/// segment contains the separator, no segment is the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CacheKey {
    repr: String,
}

impl CacheKey {
    /// Parse a key from its canonical string form.
    ///
    /// # Example
    ///
    /// ```
    /// use cache_sync::CacheKey;
    ///
    /// let key = CacheKey::parse("user:42").unwrap();
    /// assert_eq!(key.namespace(), "user");
    /// assert_eq!(key.to_string(), "user:42");
    /// ```
    pub fn parse(s: &str) -> SyncResult<Self> {
        let segments: Vec<&str> = s.split(KEY_SEPARATOR).collect();
        if segments.len() < 2 {
            return Err(SyncError::InvalidKey(format!(
                "{s}: expected format <namespace>:<segment>[:<segment>...]"
            )));
        }
        for segment in &segments {
            if segment.is_empty() {
                return Err(SyncError::InvalidKey(format!("{s}: empty segment")));
            }
            if *segment == WILDCARD {
                return Err(SyncError::InvalidKey(format!(
                    "{s}: wildcard segments are only valid in patterns"
                )));
            }
        }
        Ok(Self { repr: s.to_owned() })
    }

    /// Build a key from a namespace and ordered segments.
    pub fn build(namespace: &str, segments: &[&str]) -> SyncResult<Self> {
        let mut repr = String::from(namespace);
        for segment in segments {
            repr.push(KEY_SEPARATOR);
            repr.push_str(segment);
        }
        Self::parse(&repr)
    }

    /// Canonical string form.
    pub fn as_str(&self) -> &str {
        &self.repr
    }

    /// First segment of the key.
    pub fn namespace(&self) -> &str {
        self.repr
            .split(KEY_SEPARATOR)
            .next()
            .unwrap_or(&self.repr)
    }

    /// All segments after the namespace.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.repr.split(KEY_SEPARATOR).skip(1)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

impl TryFrom<String> for CacheKey {
    type Error = SyncError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.repr
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternSegment {
    Literal(String),
    Wildcard,
}

/// A key template with wildcard segments, evaluated against canonical keys.
///
/// `*` matches one or more whole segments; every other segment must match
/// exactly. The empty pattern matches nothing, which keeps an accidental
/// `invalidate("")` from wiping the whole cache. A pattern without any
/// wildcard matches exactly one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPattern {
    segments: Vec<PatternSegment>,
    repr: String,
}

impl KeyPattern {
    /// Parse a pattern. Never fails: an empty input yields the
    /// match-nothing pattern.
    pub fn parse(s: &str) -> Self {
        if s.is_empty() {
            return Self {
                segments: Vec::new(),
                repr: String::new(),
            };
        }
        let segments = s
            .split(KEY_SEPARATOR)
            .map(|segment| {
                if segment == WILDCARD {
                    PatternSegment::Wildcard
                } else {
                    PatternSegment::Literal(segment.to_owned())
                }
            })
            .collect();
        Self {
            segments,
            repr: s.to_owned(),
        }
    }

    /// Pattern matching exactly one key.
    pub fn exact(key: &CacheKey) -> Self {
        Self::parse(key.as_str())
    }

    /// Whether this pattern contains no wildcard and therefore behaves as an
    /// exact-key match.
    pub fn is_exact(&self) -> bool {
        !self.segments.is_empty()
            && self
                .segments
                .iter()
                .all(|s| matches!(s, PatternSegment::Literal(_)))
    }

    /// Deterministic, side-effect-free match against a canonical key string.
    pub fn matches(&self, key: &str) -> bool {
        if self.segments.is_empty() || key.is_empty() {
            return false;
        }
        let key_segments: Vec<&str> = key.split(KEY_SEPARATOR).collect();
        matches_from(&self.segments, &key_segments)
    }
}

fn matches_from(pattern: &[PatternSegment], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((PatternSegment::Literal(literal), rest)) => match key.split_first() {
            Some((segment, key_rest)) => segment == literal && matches_from(rest, key_rest),
            None => false,
        },
        // A wildcard consumes one or more segments.
        Some((PatternSegment::Wildcard, rest)) => {
            (1..=key.len()).any(|taken| matches_from(rest, &key[taken..]))
        }
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_parse_and_display() {
        let key = CacheKey::parse("chat:123:messages:0").unwrap();
        assert_eq!(key.namespace(), "chat");
        assert_eq!(key.segments().collect::<Vec<_>>(), vec!["123", "messages", "0"]);
        assert_eq!(key.to_string(), "chat:123:messages:0");
    }

    #[test]
    fn test_key_build_round_trips() {
        let built = CacheKey::build("chat", &["123", "messages", "0"]).unwrap();
        let parsed = CacheKey::parse(&built.to_string()).unwrap();
        assert_eq!(built, parsed);
    }

    #[test]
    fn test_key_rejects_malformed_input() {
        assert!(CacheKey::parse("").is_err());
        assert!(CacheKey::parse("user").is_err());
        assert!(CacheKey::parse("user:").is_err());
        assert!(CacheKey::parse(":42").is_err());
        assert!(CacheKey::parse("user:*").is_err());
    }

    #[test]
    fn test_pattern_wildcard_matches_one_or_more_segments() {
        let pattern = KeyPattern::parse("chat:*:messages:*");
        assert!(pattern.matches("chat:1:messages:0"));
        assert!(pattern.matches("chat:1:messages:0:reactions"));
        assert!(!pattern.matches("chat:1:messages"));
        assert!(!pattern.matches("chat:1:members:0"));
        assert!(!pattern.matches("feed:1:messages:0"));
    }

    #[test]
    fn test_pattern_trailing_wildcard() {
        let pattern = KeyPattern::parse("user:42:*");
        assert!(pattern.matches("user:42:profile"));
        assert!(pattern.matches("user:42:followers:count"));
        assert!(!pattern.matches("user:42"));
        assert!(!pattern.matches("user:421:profile"));
    }

    #[test]
    fn test_empty_pattern_matches_nothing() {
        let pattern = KeyPattern::parse("");
        assert!(!pattern.matches("user:42"));
        assert!(!pattern.matches(""));
    }

    #[test]
    fn test_exact_pattern_behaves_as_exact_key() {
        let pattern = KeyPattern::parse("user:42");
        assert!(pattern.is_exact());
        assert!(pattern.matches("user:42"));
        assert!(!pattern.matches("user:42:profile"));
        assert!(!pattern.matches("user:4"));
    }

    #[test]
    fn test_wildcard_cannot_match_zero_segments() {
        let pattern = KeyPattern::parse("user:*");
        assert!(!pattern.matches("user"));
        assert!(pattern.matches("user:42"));
    }
}
