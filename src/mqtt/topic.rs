//! Subscription patterns with MQTT wildcards and a first-match router over them.

use std::fmt;
use tracing::debug;

/// Errors raised while building patterns
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Empty topic filter")]
    Empty,

    /// `#` anywhere but in the final segment
    #[error("'#' must be the last segment in {0}")]
    MisplacedMultiLevel(String),

    /// Wildcard sharing a segment with other characters (`a+`, `#b`)
    #[error("Wildcard mixed into a segment in {0}")]
    MixedWildcard(String),

    /// Prefix containing wildcards or leading/trailing separators
    #[error("Invalid topic prefix: {0:?}")]
    InvalidPrefix(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `+`
    Single,
    /// `#`
    Multi,
}

/// A validated subscription filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPattern {
    filter: String,
    segments: Vec<Segment>,
}

impl TopicPattern {
    pub fn new(filter: &str) -> Result<Self, TopicError> {
        if filter.is_empty() {
            return Err(TopicError::Empty);
        }

        let parts: Vec<&str> = filter.split('/').collect();
        let last = parts.len() - 1;
        let mut segments = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let segment = match *part {
                "+" => Segment::Single,
                "#" if i == last => Segment::Multi,
                "#" => return Err(TopicError::MisplacedMultiLevel(filter.to_string())),
                p if p.contains('+') || p.contains('#') => {
                    return Err(TopicError::MixedWildcard(filter.to_string()))
                }
                p => Segment::Literal(p.to_string()),
            };
            segments.push(segment);
        }

        Ok(Self {
            filter: filter.to_string(),
            segments,
        })
    }

    /// Segment-by-segment match; `+` also matches an empty segment and `#` matches
    /// zero or more trailing segments.
    pub fn matches(&self, topic: &[&str]) -> bool {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Multi => return true,
                Segment::Single => {
                    if i >= topic.len() {
                        return false;
                    }
                }
                Segment::Literal(literal) => {
                    if topic.get(i) != Some(&literal.as_str()) {
                        return false;
                    }
                }
            }
        }
        self.segments.len() == topic.len()
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.filter)
    }
}

/// Checks that `prefix` can be used as the first levels of concrete topics.
pub fn validate_prefix(prefix: &str) -> Result<(), TopicError> {
    let bad = prefix.is_empty()
        || prefix.starts_with('/')
        || prefix.ends_with('/')
        || prefix.contains(['+', '#']);
    if bad {
        return Err(TopicError::InvalidPrefix(prefix.to_string()));
    }
    Ok(())
}

/// Ordered subscription table; the first matching pattern wins.
///
/// Immutable once built, so matching needs no locking.
#[derive(Debug, Clone)]
pub struct TopicRouter<A> {
    routes: Vec<(TopicPattern, A)>,
}

impl<A> Default for TopicRouter<A> {
    fn default() -> Self {
        Self { routes: Vec::new() }
    }
}

impl<A: Copy + fmt::Debug> TopicRouter<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, filter: &str, action: A) -> Result<Self, TopicError> {
        self.routes.push((TopicPattern::new(filter)?, action));
        Ok(self)
    }

    pub fn match_topic(&self, topic: &[&str]) -> Option<A> {
        let found = self
            .routes
            .iter()
            .find(|(pattern, _)| pattern.matches(topic))
            .map(|(_, action)| *action);
        if found.is_none() {
            debug!("No route for {}", topic.join("/"));
        }
        found
    }

    /// Filters to subscribe to, in table order.
    pub fn filters(&self) -> Vec<String> {
        self.routes
            .iter()
            .map(|(pattern, _)| pattern.filter().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
