//! Topic patterns for telemetry subscriptions.
//!
//! - `*` matches every topic
//! - `prefix.*` matches any topic starting with `prefix.`
//! - anything else must match exactly

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicPattern {
    All,
    Prefix(String),
    Exact(String),
}

impl TopicPattern {
    pub fn parse(pattern: &str) -> Self {
        if pattern == "*" {
            Self::All
        } else if let Some(prefix) = pattern.strip_suffix(".*") {
            Self::Prefix(format!("{prefix}."))
        } else {
            Self::Exact(pattern.to_string())
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            Self::All => true,
            Self::Prefix(prefix) => topic.starts_with(prefix.as_str()),
            Self::Exact(exact) => topic == exact,
        }
    }
}

impl From<&str> for TopicPattern {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}

impl fmt::Display for TopicPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("*"),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
            Self::Exact(exact) => f.write_str(exact),
        }
    }
}
