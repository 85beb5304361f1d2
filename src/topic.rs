//! Topic expression syntax.
//!
//! Topics are hierarchical names separated by `/` (e.g. `"sport/football/scores"`).
//! Registered expressions may be wildcarded:
//! - `*` matches exactly one level; inside a level (`*.c`) it matches any run of
//!   characters within that level
//! - `//` matches zero or more intermediate levels
//! - a trailing `//.` matches the level itself and everything below it
//!
//! Published (event) topics are never wildcarded. A leading single `/` is
//! invalid in both forms.
//!
//! Registration and publish build their full expressions differently when the
//! caller supplies no sub-topic: a registration means "the whole topic space"
//! (`space//.`) while a publish means "the topic space root" (`space`). Keep
//! [`build_add_topic_expression`] and [`build_send_topic_expression`] separate.

use std::fmt;

use regex::Regex;

use crate::error::SyntaxError;

/// Level separator.
pub const SEPARATOR: char = '/';
/// "Zero or more levels" marker.
pub const DOUBLE_SEPARATOR: &str = "//";
/// Single-level wildcard.
pub const MATCH_ONE: char = '*';
/// Suffix meaning "this level and all descendants".
pub const DESCENDANTS_SUFFIX: &str = "//.";

const SELF_LEVEL: &str = ".";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Level(String),
    AnyDepth,
}

fn invalid(topic: &str, reason: &str) -> SyntaxError {
    SyntaxError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_parts(topic: &str) -> Result<Vec<Part>, SyntaxError> {
    if topic.is_empty() {
        return Err(invalid(topic, "topic is empty"));
    }

    let mut parts = Vec::new();
    let mut rest = topic;

    if let Some(stripped) = rest.strip_prefix(DOUBLE_SEPARATOR) {
        parts.push(Part::AnyDepth);
        rest = stripped;
    } else if rest.starts_with(SEPARATOR) {
        return Err(SyntaxError::LeadingSeparator {
            topic: topic.to_string(),
        });
    }

    loop {
        let end = rest.find(SEPARATOR).unwrap_or(rest.len());
        let level = &rest[..end];
        if level.is_empty() {
            return Err(invalid(topic, "empty topic level"));
        }
        parts.push(Part::Level(level.to_string()));

        rest = &rest[end..];
        if rest.is_empty() {
            break;
        }

        if let Some(stripped) = rest.strip_prefix(DOUBLE_SEPARATOR) {
            if stripped.starts_with(SEPARATOR) {
                return Err(invalid(topic, "more than two consecutive separators"));
            }
            if stripped.is_empty() {
                return Err(invalid(topic, "'//' must be followed by a level"));
            }
            parts.push(Part::AnyDepth);
            rest = stripped;
        } else {
            rest = &rest[1..];
            if rest.is_empty() {
                return Err(invalid(topic, "trailing separator"));
            }
        }
    }

    // "." is only meaningful as the final level of a "//." suffix.
    for (idx, part) in parts.iter().enumerate() {
        if let Part::Level(level) = part {
            if level == SELF_LEVEL {
                let last = idx + 1 == parts.len();
                let after_any = idx > 0 && parts[idx - 1] == Part::AnyDepth;
                if !(last && after_any) {
                    return Err(invalid(topic, "'.' is only valid in a trailing '//.'"));
                }
            }
        }
    }

    Ok(parts)
}

/// Validates a registration topic expression (wildcards allowed).
pub fn check_topic_syntax(topic: &str) -> Result<(), SyntaxError> {
    parse_parts(topic).map(|_| ())
}

/// Validates a published topic (no wildcards).
pub fn check_event_topic_syntax(topic: &str) -> Result<(), SyntaxError> {
    let parts = parse_parts(topic)?;
    for part in &parts {
        match part {
            Part::AnyDepth => {
                return Err(SyntaxError::WildcardInEventTopic {
                    topic: topic.to_string(),
                })
            }
            Part::Level(level) if level.contains(MATCH_ONE) || level == SELF_LEVEL => {
                return Err(SyntaxError::WildcardInEventTopic {
                    topic: topic.to_string(),
                })
            }
            Part::Level(_) => {}
        }
    }
    Ok(())
}

/// Returns true if the discriminator contains wildcards.
///
/// A missing discriminator stands for the whole topic space and counts as
/// wildcarded.
#[must_use]
pub fn is_wildcarded(discriminator: Option<&str>) -> bool {
    match discriminator {
        None => true,
        Some(d) => d.contains(DOUBLE_SEPARATOR) || d.contains(MATCH_ONE),
    }
}

/// Combines a topic space and a caller-supplied topic for registration.
///
/// - `None` subscribes to the whole topic space: `space//.`
/// - `""` subscribes to the topic space root: `space`
/// - a topic beginning `//` becomes `space//…`
/// - a topic beginning with a single `/` is rejected
pub fn build_add_topic_expression(
    topic_space: &str,
    discriminator: Option<&str>,
) -> Result<String, SyntaxError> {
    let combined = match discriminator {
        None => format!("{topic_space}{DESCENDANTS_SUFFIX}"),
        Some(d) if d.trim().is_empty() => topic_space.to_string(),
        Some(d) if d.starts_with(DOUBLE_SEPARATOR) => format!("{topic_space}{d}"),
        Some(d) if d.starts_with(SEPARATOR) => {
            return Err(SyntaxError::LeadingSeparator {
                topic: d.to_string(),
            })
        }
        Some(d) => format!("{topic_space}{SEPARATOR}{d}"),
    };
    Ok(combined)
}

/// Combines a topic space and a published topic.
///
/// A missing or blank discriminator publishes at the topic space root.
#[must_use]
pub fn build_send_topic_expression(topic_space: &str, discriminator: Option<&str>) -> String {
    match discriminator {
        Some(d) if !d.trim().is_empty() => format!("{topic_space}{SEPARATOR}{d}"),
        _ => topic_space.to_string(),
    }
}

/// Returns the fully qualified prefix preceding the first wildcard.
///
/// The stem ends at whichever wildcard marker comes first. For a `*` the stem
/// stops at the level boundary before it, so `"a/*.c"` yields `"a"`; for `//`
/// it stops right before the marker, so `"a/b//c"` yields `"a/b"`. A topic with
/// no wildcards is its own stem.
#[must_use]
pub fn retrieve_non_wildcard_stem(topic: &str) -> String {
    let wild_many = topic.find(DOUBLE_SEPARATOR);
    let wild_one = topic.find(MATCH_ONE);

    let stem = match (wild_many, wild_one) {
        (Some(many), Some(one)) if many < one => &topic[..many],
        (_, Some(one)) => {
            let before = &topic[..one];
            match before.rfind(SEPARATOR) {
                Some(sep) => &topic[..sep],
                None => "",
            }
        }
        (Some(many), None) => &topic[..many],
        (None, None) => topic,
    };
    stem.to_string()
}

/// Returns true if one stem is a string prefix of the other.
///
/// This is the conservative overlap test used when two wildcarded expressions
/// cannot be evaluated against each other. It admits false positives but never
/// false negatives.
#[must_use]
pub fn stems_overlap(a: &str, b: &str) -> bool {
    a.starts_with(b) || b.starts_with(a)
}

fn level_regex(level: &str) -> String {
    if level == "*" {
        return "[^/]+".to_string();
    }
    level
        .split(MATCH_ONE)
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join("[^/]*")
}

fn compile_regex(topic: &str, parts: &[Part]) -> Result<Regex, SyntaxError> {
    let mut re = String::from("^");
    let mut emitted = false;
    let mut any_depth = false;

    for part in parts {
        match part {
            Part::AnyDepth => any_depth = true,
            Part::Level(level) if level == SELF_LEVEL => {
                if emitted {
                    re.push_str("(?:/[^/]+)*");
                } else {
                    re.push_str("[^/]+(?:/[^/]+)*");
                }
                any_depth = false;
                emitted = true;
            }
            Part::Level(level) => {
                if emitted {
                    if any_depth {
                        re.push_str("(?:/[^/]+)*/");
                    } else {
                        re.push(SEPARATOR);
                    }
                } else if any_depth {
                    re.push_str("(?:[^/]+/)*");
                }
                re.push_str(&level_regex(level));
                any_depth = false;
                emitted = true;
            }
        }
    }
    re.push('$');

    Regex::new(&re).map_err(|e| invalid(topic, &format!("cannot compile expression: {e}")))
}

/// A compiled topic expression.
#[derive(Debug, Clone)]
pub struct TopicPattern {
    expression: String,
    stem: String,
    regex: Option<Regex>,
}

impl TopicPattern {
    /// Compiles a registration topic expression.
    pub fn compile(expression: &str) -> Result<Self, SyntaxError> {
        let parts = parse_parts(expression)?;
        let wildcarded = is_wildcarded(Some(expression));
        let regex = if wildcarded {
            Some(compile_regex(expression, &parts)?)
        } else {
            None
        };
        Ok(Self {
            expression: expression.to_string(),
            stem: retrieve_non_wildcard_stem(expression),
            regex,
        })
    }

    /// The source expression.
    #[must_use]
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The non-wildcarded stem (the whole expression if not wildcarded).
    #[must_use]
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Returns true if this expression contains wildcards.
    #[must_use]
    pub const fn is_wildcarded(&self) -> bool {
        self.regex.is_some()
    }

    /// Returns true if the published topic matches this expression.
    #[must_use]
    pub fn matches(&self, topic: &str) -> bool {
        match &self.regex {
            Some(regex) => topic.starts_with(self.stem.as_str()) && regex.is_match(topic),
            None => self.expression == topic,
        }
    }
}

impl PartialEq for TopicPattern {
    fn eq(&self, other: &Self) -> bool {
        self.expression == other.expression
    }
}

impl Eq for TopicPattern {}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matches(expr: &str, topic: &str) -> bool {
        TopicPattern::compile(expr).unwrap().matches(topic)
    }

    #[test]
    fn stem_stops_at_first_wildcard() {
        assert_eq!(retrieve_non_wildcard_stem("a/b//c"), "a/b");
        assert_eq!(retrieve_non_wildcard_stem("a/*.c"), "a");
        assert_eq!(retrieve_non_wildcard_stem("a/*/b//c"), "a");
        assert_eq!(retrieve_non_wildcard_stem("a//b/*"), "a");
        assert_eq!(retrieve_non_wildcard_stem("*/b"), "");
        assert_eq!(retrieve_non_wildcard_stem("//b"), "");
        assert_eq!(retrieve_non_wildcard_stem("a/b/c"), "a/b/c");
    }

    #[test]
    fn leading_separator_is_rejected() {
        assert!(matches!(
            check_topic_syntax("/a/b"),
            Err(SyntaxError::LeadingSeparator { .. })
        ));
        assert!(matches!(
            build_add_topic_expression("ts", Some("/a")),
            Err(SyntaxError::LeadingSeparator { .. })
        ));
    }

    #[test]
    fn malformed_topics_are_rejected() {
        assert!(check_topic_syntax("").is_err());
        assert!(check_topic_syntax("a/").is_err());
        assert!(check_topic_syntax("a//").is_err());
        assert!(check_topic_syntax("a///b").is_err());
        assert!(check_topic_syntax("a/./b").is_err());
        assert!(check_topic_syntax("a/b//.").is_ok());
        assert!(check_topic_syntax("//a").is_ok());
    }

    #[test]
    fn event_topics_reject_wildcards() {
        assert!(check_event_topic_syntax("a/b/c").is_ok());
        assert!(check_event_topic_syntax("a/b.c").is_ok());
        assert!(matches!(
            check_event_topic_syntax("a//b"),
            Err(SyntaxError::WildcardInEventTopic { .. })
        ));
        assert!(check_event_topic_syntax("a/*").is_err());
    }

    #[test]
    fn add_and_send_expressions_differ_for_missing_topic() {
        assert_eq!(build_add_topic_expression("ts", None).unwrap(), "ts//.");
        assert_eq!(build_send_topic_expression("ts", None), "ts");
        assert_eq!(build_add_topic_expression("ts", Some("")).unwrap(), "ts");
        assert_eq!(build_send_topic_expression("ts", Some("  ")), "ts");
        assert_eq!(build_add_topic_expression("ts", Some("//x")).unwrap(), "ts//x");
        assert_eq!(build_add_topic_expression("ts", Some("a/b")).unwrap(), "ts/a/b");
    }

    #[test]
    fn single_level_wildcard() {
        assert!(matches("a/*/c", "a/b/c"));
        assert!(!matches("a/*/c", "a/c"));
        assert!(!matches("a/*/c", "a/b/x/c"));
        assert!(matches("a/*.c", "a/x.c"));
        assert!(!matches("a/*.c", "a/x/y.c"));
    }

    #[test]
    fn multi_level_wildcard() {
        assert!(matches("a//c", "a/c"));
        assert!(matches("a//c", "a/b/x/c"));
        assert!(!matches("a//c", "a/b/x/d"));
        assert!(matches("//c", "c"));
        assert!(matches("//c", "x/y/c"));
    }

    #[test]
    fn descendants_suffix_includes_self() {
        assert!(matches("ts//.", "ts"));
        assert!(matches("ts//.", "ts/a/b"));
        assert!(!matches("ts//.", "tsx"));
        assert!(!matches("ts//.", "other/ts"));
    }

    #[test]
    fn exact_patterns_use_equality() {
        let p = TopicPattern::compile("a/b").unwrap();
        assert!(!p.is_wildcarded());
        assert_eq!(p.stem(), "a/b");
        assert!(p.matches("a/b"));
        assert!(!p.matches("a/b/c"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        assert!(matches("a+b/*", "a+b/x"));
        assert!(!matches("a+b/*", "aab/x"));
    }

    #[test]
    fn wildcard_detection() {
        assert!(is_wildcarded(None));
        assert!(is_wildcarded(Some("a//b")));
        assert!(is_wildcarded(Some("a/*")));
        assert!(!is_wildcarded(Some("a/b")));
    }

    #[test]
    fn stem_overlap_either_direction() {
        assert!(stems_overlap("a/b", "a"));
        assert!(stems_overlap("a", "a/b"));
        assert!(!stems_overlap("a/b", "a/c"));
    }
}
