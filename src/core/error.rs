//! Error values surfaced through the pull pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A per-revision failure. `transient` marks errors whose resolution is to
/// retry the sequence on a future pull.
#[derive(Clone, Debug, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("rev error {code}: {message}")]
pub struct RevError {
    pub code: u16,
    pub message: String,
    pub transient: bool,
}

impl RevError {
    pub fn new(code: u16, message: impl Into<String>, transient: bool) -> Self {
        Self {
            code,
            message: message.into(),
            transient,
        }
    }

    pub fn to_reply(&self) -> ReplyError {
        ReplyError::new(self.code, self.message.clone())
    }
}

/// A failure reported by one of the store gateways.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("store error: {message}")]
pub struct StoreError {
    pub message: String,
    pub transient: bool,
}

impl StoreError {
    pub fn new(message: impl Into<String>, transient: bool) -> Self {
        Self {
            message: message.into(),
            transient,
        }
    }

    pub fn into_rev_error(self) -> RevError {
        RevError {
            code: 500,
            message: self.message,
            transient: self.transient,
        }
    }
}

/// An error reply to a protocol message.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("reply error {code}: {message}")]
pub struct ReplyError {
    pub code: u16,
    pub message: String,
}

impl ReplyError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(409, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }
}
