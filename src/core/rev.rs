//! Replicated revision views.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::RevError;
use super::seq::RemoteSeq;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevFlags(u32);

impl RevFlags {
    pub const NONE: RevFlags = RevFlags(0);
    pub const DELETED: RevFlags = RevFlags(1);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: RevFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn deleted(self) -> bool {
        self.contains(Self::DELETED)
    }
}

/// Metadata of one revision moving through the pull, and the outcome of its
/// processing once finished.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PulledRev {
    pub doc_id: String,
    pub rev_id: String,
    pub flags: RevFlags,
    pub remote_seq: RemoteSeq,
    pub error: Option<RevError>,
}

impl PulledRev {
    pub fn deleted(&self) -> bool {
        self.flags.deleted()
    }

    pub fn error_is_transient(&self) -> bool {
        self.error.as_ref().is_some_and(|err| err.transient)
    }

    /// The external completion view, produced by field copy.
    pub fn to_document_ended(&self) -> DocumentEnded {
        DocumentEnded {
            doc_id: self.doc_id.clone(),
            rev_id: self.rev_id.clone(),
            flags: self.flags,
            remote_seq: self.remote_seq.clone(),
            error: self.error.clone(),
            error_is_transient: self.error_is_transient(),
        }
    }
}

/// What the delegate sees when a revision's pull ends, successfully or not.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentEnded {
    pub doc_id: String,
    pub rev_id: String,
    pub flags: RevFlags,
    pub remote_seq: RemoteSeq,
    pub error: Option<RevError>,
    pub error_is_transient: bool,
}

/// A revision body decoded by the external parser, ready for insertion.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedRev {
    pub doc_id: String,
    pub rev_id: String,
    pub history: Vec<String>,
    pub deleted: bool,
    pub body: Bytes,
}
