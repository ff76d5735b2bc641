//! MQTT topic pattern matching.
//!
//! Rules, in order:
//! 1. an identical topic always matches;
//! 2. a pattern without `+`/`#` is a legacy prefix (`msh/US/` matches
//!    everything below it);
//! 3. otherwise the pattern is split on `/`: `+` matches exactly one
//!    non-empty segment, a final `#` matches whatever follows, and every other
//!    segment must be equal.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    SingleLevel,
    MultiLevel,
}

/// A `#` that is not the last segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidPattern(pub String);

impl fmt::Display for InvalidPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'#' must be the final segment of topic pattern '{}'", self.0)
    }
}

impl std::error::Error for InvalidPattern {}

fn has_wildcard(pattern: &str) -> bool {
    pattern.contains('+') || pattern.contains('#')
}

/// A compiled subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    raw: String,
    segments: Option<Vec<Segment>>,
}

impl TopicPattern {
    pub fn compile(pattern: &str) -> Result<Self, InvalidPattern> {
        if !has_wildcard(pattern) {
            return Ok(Self {
                raw: pattern.to_string(),
                segments: None,
            });
        }
        let parts: Vec<&str> = pattern.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let seg = match *part {
                "+" => Segment::SingleLevel,
                "#" if i == last => Segment::MultiLevel,
                "#" => return Err(InvalidPattern(pattern.to_string())),
                literal => Segment::Literal(literal.to_string()),
            };
            segments.push(seg);
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments: Some(segments),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        if self.raw == topic {
            return true;
        }
        let Some(segments) = &self.segments else {
            return topic.starts_with(&self.raw);
        };
        let mut parts = topic.split('/');
        for seg in segments {
            match seg {
                // `#` needs the separator before it to be present; the
                // remainder may be empty or span several levels.
                Segment::MultiLevel => return parts.next().is_some(),
                Segment::SingleLevel => match parts.next() {
                    Some(part) if !part.is_empty() => {}
                    _ => return false,
                },
                Segment::Literal(lit) => {
                    if parts.next() != Some(lit.as_str()) {
                        return false;
                    }
                }
            }
        }
        parts.next().is_none()
    }
}

/// One-shot match without keeping the compiled pattern. Invalid patterns
/// never match anything but themselves.
pub fn matches(topic: &str, pattern: &str) -> bool {
    match TopicPattern::compile(pattern) {
        Ok(compiled) => compiled.matches(topic),
        Err(_) => topic == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("msh/US/bayarea/2", "msh/US/#"));
        assert!(matches("msh/US/2/e/LongFast/!a1b2c3d4", "msh/US/#"));
        assert!(matches("msh/US/", "msh/US/#"));
        assert!(!matches("msh/US", "msh/US/#"));
        assert!(!matches("msh/EU/1", "msh/US/#"));
        assert!(matches("anything/at/all", "#"));
    }

    #[test]
    fn single_level_wildcard() {
        assert!(matches("msh/US/1", "msh/US/+"));
        assert!(!matches("msh/US/1/2", "msh/US/+"));
        assert!(!matches("msh/US/", "msh/US/+"));
        assert!(matches("msh/US/1/e", "msh/+/1/+"));
        assert!(matches("msh/US/1/e/LongFast", "msh/+/+/e/#"));
    }

    #[test]
    fn legacy_prefix_patterns() {
        assert!(matches("msh/US/1", "msh/US/"));
        assert!(matches("msh/US/bayarea/2/e", "msh/US/"));
        assert!(!matches("msh/EU/1", "msh/US/"));
        assert!(matches("msh/US/1", "msh/US/1"));
    }

    #[test]
    fn literals_are_not_regex() {
        assert!(!matches("msh/USA/1", "msh/U.A/+"));
        assert!(matches("msh/U.A/1", "msh/U.A/+"));
    }

    #[test]
    fn hash_must_be_final() {
        let err = TopicPattern::compile("msh/#/e").unwrap_err();
        assert!(err.to_string().contains("msh/#/e"));
        assert!(!matches("msh/US/e", "msh/#/e"));
        assert!(matches("msh/#/e", "msh/#/e"));
    }
}
