//! Opaque remote sequence identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A remote-assigned position in the server's change feed.
///
/// The remote defines the ordering; the puller only stores, compares for
/// equality, and echoes these values back. JSON string sequences keep their
/// text, every other feed value is normalized to its compact JSON form, so a
/// sequence read from a change row matches the same sequence arriving later
/// as a message property.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteSeq(String);

impl RemoteSeq {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The absent sequence, meaning "from the beginning of the feed".
    pub fn none() -> Self {
        Self(String::new())
    }

    pub fn from_feed_value(value: &Value) -> Self {
        match value {
            Value::String(text) => Self(text.clone()),
            Value::Null => Self::none(),
            other => Self(other.to_string()),
        }
    }

    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RemoteSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteSeq({})", self.0)
    }
}

impl fmt::Display for RemoteSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RemoteSeq {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
