//! Topic path canonicalization and matching
//!
//! A topic path is a hierarchical tag such as `location/restaurants/city42`.
//! Paths are canonicalized (lowercased, slashes collapsed and trimmed) before
//! validation, so `/Location//Restaurants/` and `location/restaurants` are the
//! same topic. A trailing `*` segment marks a wildcard over everything below
//! its parent.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum number of segments in a topic path
pub const MAX_TOPIC_DEPTH: usize = 16;

/// Maximum length of a single segment
pub const MAX_SEGMENT_LEN: usize = 64;

const WILDCARD: &str = "*";

/// Canonicalize a raw topic string: lowercase, collapse repeated slashes and
/// strip leading/trailing slashes. Does not validate characters.
pub fn canonicalize_topic(topic: &str) -> String {
    topic
        .trim()
        .split('/')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("/")
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic path cannot be empty")]
    Empty,
    #[error("Topic path has {0} segments, maximum is {MAX_TOPIC_DEPTH}")]
    TooDeep(usize),
    #[error("Topic segment '{0}' exceeds {MAX_SEGMENT_LEN} characters")]
    SegmentTooLong(String),
    #[error("Topic segment contains invalid character: '{0}'")]
    InvalidChar(char),
    #[error("Wildcard '*' is only allowed as the final segment")]
    MisplacedWildcard,
}

/// Validated, canonical topic path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPath {
    segments: Vec<String>,
}

impl TopicPath {
    /// Parse and validate a topic path
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        let canonical = canonicalize_topic(raw);
        if canonical.is_empty() {
            return Err(TopicError::Empty);
        }

        let segments: Vec<String> = canonical.split('/').map(str::to_string).collect();
        if segments.len() > MAX_TOPIC_DEPTH {
            return Err(TopicError::TooDeep(segments.len()));
        }

        let last = segments.len() - 1;
        for (i, segment) in segments.iter().enumerate() {
            if segment == WILDCARD {
                if i != last {
                    return Err(TopicError::MisplacedWildcard);
                }
                continue;
            }
            if segment.len() > MAX_SEGMENT_LEN {
                return Err(TopicError::SegmentTooLong(segment.clone()));
            }
            if let Some(ch) = segment
                .chars()
                .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
            {
                return Err(TopicError::InvalidChar(ch));
            }
        }

        Ok(Self { segments })
    }

    /// Segments without a trailing wildcard
    pub fn concrete_segments(&self) -> &[String] {
        if self.is_wildcard() {
            &self.segments[..self.segments.len() - 1]
        } else {
            &self.segments
        }
    }

    /// All segments including a trailing wildcard
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_wildcard(&self) -> bool {
        self.segments.last().map(String::as_str) == Some(WILDCARD)
    }

    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Parent topic, `None` at the root segment
    pub fn parent(&self) -> Option<TopicPath> {
        let concrete = self.concrete_segments();
        if concrete.len() <= 1 {
            return None;
        }
        Some(TopicPath {
            segments: concrete[..concrete.len() - 1].to_vec(),
        })
    }

    /// Ancestors from the nearest parent up to the root segment
    pub fn ancestors(&self) -> Vec<TopicPath> {
        let mut out = Vec::new();
        let mut current = self.parent();
        while let Some(topic) = current {
            current = topic.parent();
            out.push(topic);
        }
        out
    }

    /// How this topic (as a capability descriptor) relates to a query topic
    pub fn match_query(&self, query: &TopicPath) -> TopicMatch {
        let own = self.concrete_segments();
        let asked = query.concrete_segments();

        if !self.is_wildcard() && !query.is_wildcard() && own == asked {
            return TopicMatch::Exact;
        }

        if own.len() <= asked.len() && asked.starts_with(own) && !own.is_empty() {
            return TopicMatch::Covers { depth: own.len() };
        }

        if asked.len() < own.len() && own.starts_with(asked) && !asked.is_empty() {
            return TopicMatch::Narrower { depth: asked.len() };
        }

        let shared = own.iter().filter(|s| asked.contains(s)).count();
        if shared > 0 {
            TopicMatch::Token { shared }
        } else {
            TopicMatch::None
        }
    }
}

/// Relationship between a descriptor topic and a query topic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicMatch {
    /// Same concrete path
    Exact,
    /// Descriptor is an ancestor of (or wildcard over) the query
    Covers { depth: usize },
    /// Descriptor lies below the query
    Narrower { depth: usize },
    /// Segments shared at any position
    Token { shared: usize },
    None,
}

impl TopicMatch {
    pub fn is_match(&self) -> bool {
        !matches!(self, TopicMatch::None)
    }

    /// Whether the descriptor is close enough to serve the query locally
    pub fn is_direct(&self) -> bool {
        matches!(
            self,
            TopicMatch::Exact | TopicMatch::Covers { .. } | TopicMatch::Narrower { .. }
        )
    }

    /// Tie-breaking weight: prefix matches always outrank token matches,
    /// and exact matches outrank everything.
    pub fn specificity(&self) -> usize {
        match self {
            TopicMatch::Exact => 3 * MAX_TOPIC_DEPTH,
            TopicMatch::Covers { depth } => 2 * MAX_TOPIC_DEPTH + depth,
            TopicMatch::Narrower { depth } => MAX_TOPIC_DEPTH + depth,
            TopicMatch::Token { shared } => *shared,
            TopicMatch::None => 0,
        }
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("/"))
    }
}

impl FromStr for TopicPath {
    type Err = TopicError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for TopicPath {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TopicPath {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        TopicPath::parse(&raw).map_err(serde::de::Error::custom)
    }
}
