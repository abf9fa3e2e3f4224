//! Subscription filters.
//!
//! A [`Filter`] is a small expression tree evaluated against each message
//! before it is queued for a subscriber. Filters are usually built from the
//! query parameters a client sends ([`FilterParams`]); every clause present
//! must match.

use crate::error::BrokerError;
use crate::message::{Message, MessageId, Priority};
use globset::{GlobBuilder, GlobMatcher};
use std::fmt;

/// A case-insensitive glob pattern.
#[derive(Clone)]
pub struct Pattern {
    source: String,
    matcher: GlobMatcher,
}

impl Pattern {
    /// Compile a pattern. Text without wildcards matches exactly (ignoring
    /// case).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidFilter`] if the glob is malformed.
    pub fn new(source: &str) -> Result<Self, BrokerError> {
        let matcher = GlobBuilder::new(source)
            .case_insensitive(true)
            .literal_separator(false)
            .build()
            .map_err(|e| BrokerError::InvalidFilter(format!("bad pattern {source:?}: {e}")))?
            .compile_matcher();
        Ok(Self {
            source: source.to_string(),
            matcher,
        })
    }

    #[must_use]
    pub fn is_match(&self, text: &str) -> bool {
        self.matcher.is_match(text)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.source).finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Filter expression.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    /// Matches everything.
    #[default]
    Any,
    MinPriority(Priority),
    PriorityIn(Vec<Priority>),
    /// Message carries the tag (case-insensitive).
    Tag(String),
    /// Title matches; messages without a title never match.
    TitleMatches(Pattern),
    BodyMatches(Pattern),
    IdIs(MessageId),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    /// Evaluate against a message.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Filter::Any => true,
            Filter::MinPriority(min) => message.priority >= *min,
            Filter::PriorityIn(set) => set.contains(&message.priority),
            Filter::Tag(tag) => message.has_tag(tag),
            Filter::TitleMatches(p) => message.title.as_deref().is_some_and(|t| p.is_match(t)),
            Filter::BodyMatches(p) => p.is_match(&message.body),
            Filter::IdIs(id) => message.id == *id,
            Filter::And(all) => all.iter().all(|f| f.matches(message)),
            Filter::Or(any) => any.iter().any(|f| f.matches(message)),
            Filter::Not(inner) => !inner.matches(message),
        }
    }

    #[must_use]
    pub fn is_any(&self) -> bool {
        matches!(self, Filter::Any)
    }

    /// Build from query-style parameters.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::InvalidFilter`] for unparsable values.
    pub fn from_params(params: &FilterParams) -> Result<Self, BrokerError> {
        let mut clauses = Vec::new();

        if let Some(ids) = non_empty(params.id.as_deref()) {
            let ids = split_list(ids)
                .map(|s| {
                    s.parse::<MessageId>()
                        .map(Filter::IdIs)
                        .map_err(|_| BrokerError::InvalidFilter(format!("invalid id: {s}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            clauses.push(one_or(ids, Filter::Or));
        }
        if let Some(body) = non_empty(params.message.as_deref()) {
            clauses.push(Filter::BodyMatches(Pattern::new(body)?));
        }
        if let Some(title) = non_empty(params.title.as_deref()) {
            clauses.push(Filter::TitleMatches(Pattern::new(title)?));
        }
        if let Some(priority) = non_empty(params.priority.as_deref()) {
            clauses.push(parse_priority(priority)?);
        }
        if let Some(tags) = non_empty(params.tags.as_deref()) {
            let tags: Vec<Filter> = split_list(tags).map(|t| Filter::Tag(t.to_string())).collect();
            clauses.push(one_or(tags, Filter::And));
        }

        Ok(match clauses.len() {
            0 => Filter::Any,
            _ => one_or(clauses, Filter::And),
        })
    }
}

/// Raw filter parameters as received from a client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterParams {
    /// Comma-separated message ids.
    pub id: Option<String>,
    /// Body pattern.
    pub message: Option<String>,
    /// Title pattern.
    pub title: Option<String>,
    /// `4,5`, `high,urgent` or `>=high`.
    pub priority: Option<String>,
    /// Comma-separated tags, all required.
    pub tags: Option<String>,
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.map(str::trim).filter(|s| !s.is_empty())
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn one_or(mut clauses: Vec<Filter>, combine: fn(Vec<Filter>) -> Filter) -> Filter {
    if clauses.len() == 1 {
        clauses.remove(0)
    } else {
        combine(clauses)
    }
}

fn parse_priority(s: &str) -> Result<Filter, BrokerError> {
    let invalid = || BrokerError::InvalidFilter(format!("invalid priority: {s}"));
    if let Some(min) = s.strip_prefix(">=") {
        return min.parse().map(Filter::MinPriority).map_err(|_| invalid());
    }
    let set = split_list(s)
        .map(|p| p.parse::<Priority>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>, _>>()?;
    if set.is_empty() {
        return Err(invalid());
    }
    Ok(Filter::PriorityIn(set))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message() -> Message {
        let mut m = Message::new(7, "alerts", 0, "Disk /var is 91% full");
        m.title = Some("Disk space low".to_string());
        m.priority = Priority::High;
        m.tags = vec!["warning".to_string(), "db1".to_string()];
        m
    }

    fn params() -> FilterParams {
        FilterParams::default()
    }

    #[test]
    fn test_empty_params_match_everything() {
        let f = Filter::from_params(&params()).unwrap();
        assert!(f.is_any());
        assert!(f.matches(&message()));
    }

    #[test]
    fn test_priority_forms() {
        let set = Filter::from_params(&FilterParams {
            priority: Some("4,5".into()),
            ..params()
        })
        .unwrap();
        assert_eq!(set, Filter::PriorityIn(vec![Priority::High, Priority::Urgent]));
        assert!(set.matches(&message()));

        let min = Filter::from_params(&FilterParams {
            priority: Some(">=urgent".into()),
            ..params()
        })
        .unwrap();
        assert!(!min.matches(&message()));

        assert!(matches!(
            Filter::from_params(&FilterParams {
                priority: Some("loud".into()),
                ..params()
            }),
            Err(BrokerError::InvalidFilter(_))
        ));
    }

    #[test]
    fn test_tags_all_required() {
        let both = Filter::from_params(&FilterParams {
            tags: Some("warning, DB1".into()),
            ..params()
        })
        .unwrap();
        assert!(both.matches(&message()));

        let missing = Filter::from_params(&FilterParams {
            tags: Some("warning,db2".into()),
            ..params()
        })
        .unwrap();
        assert!(!missing.matches(&message()));
    }

    #[test]
    fn test_title_and_body_globs() {
        let f = Filter::from_params(&FilterParams {
            title: Some("disk *".into()),
            message: Some("*91%*".into()),
            ..params()
        })
        .unwrap();
        assert!(f.matches(&message()));

        let mut untitled = message();
        untitled.title = None;
        assert!(!f.matches(&untitled));
    }

    #[test]
    fn test_id_filter() {
        let f = Filter::from_params(&FilterParams {
            id: Some("3,7".into()),
            ..params()
        })
        .unwrap();
        assert!(f.matches(&message()));
        assert!(Filter::from_params(&FilterParams {
            id: Some("seven".into()),
            ..params()
        })
        .is_err());
    }

    #[test]
    fn test_combinators() {
        let m = message();
        let f = Filter::Or(vec![
            Filter::Tag("nope".into()),
            Filter::Not(Box::new(Filter::MinPriority(Priority::Urgent))),
        ]);
        assert!(f.matches(&m));
        assert!(!Filter::Not(Box::new(f)).matches(&m));
    }

    #[test]
    fn test_bad_glob_rejected() {
        assert!(matches!(Pattern::new("[oops"), Err(BrokerError::InvalidFilter(_))));
    }
}
