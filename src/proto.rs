//! Protocol message schemas: inbound envelopes, the `subChanges` request,
//! and change-list parsing.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::Value;
use thiserror::Error;

use crate::config::PullOptions;
use crate::core::{RemoteSeq, RevFlags};

/// Filter name the remote recognizes for channel-scoped pulls.
pub const CHANNEL_FILTER: &str = "sync_gateway/bychannel";

pub type MessageNo = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Changes,
    ProposeChanges,
    Rev,
    NoRev,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::Changes => "changes",
            Profile::ProposeChanges => "proposeChanges",
            Profile::Rev => "rev",
            Profile::NoRev => "norev",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "changes" => Some(Profile::Changes),
            "proposeChanges" => Some(Profile::ProposeChanges),
            "rev" => Some(Profile::Rev),
            "norev" => Some(Profile::NoRev),
            _ => None,
        }
    }
}

/// An inbound protocol message, already routed by profile. The transport
/// keeps the framing; the puller sees properties, body, and the reply
/// obligation.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageIn {
    pub profile: Profile,
    pub number: MessageNo,
    pub properties: BTreeMap<String, String>,
    pub body: Bytes,
    pub no_reply: bool,
}

impl MessageIn {
    pub fn new(profile: Profile, number: MessageNo) -> Self {
        Self {
            profile,
            number,
            properties: BTreeMap::new(),
            body: Bytes::new(),
            no_reply: false,
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn without_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }
}

/// The outbound change-feed subscription request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SubChanges {
    pub since: RemoteSeq,
    pub continuous: bool,
    pub batch: u32,
    pub active_only: bool,
    pub filter: Option<String>,
    pub channels: Option<String>,
    pub filter_params: BTreeMap<String, String>,
    pub doc_ids: Option<Vec<String>>,
}

impl SubChanges {
    pub fn from_options(
        options: &PullOptions,
        since: RemoteSeq,
        batch: u32,
        active_only: bool,
    ) -> Self {
        let (filter, channels, filter_params) = if !options.channels.is_empty() {
            (
                Some(CHANNEL_FILTER.to_string()),
                Some(options.channels.join(",")),
                BTreeMap::new(),
            )
        } else if let Some(filter) = &options.filter {
            (Some(filter.clone()), None, options.filter_params.clone())
        } else {
            (None, None, BTreeMap::new())
        };

        Self {
            since,
            continuous: options.continuous(),
            batch,
            active_only,
            filter,
            channels,
            filter_params,
            doc_ids: options.doc_ids.clone(),
        }
    }

    /// The request's property map, as the transport will put it on the wire.
    pub fn properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        if !self.since.is_none() {
            props.insert("since".to_string(), self.since.as_str().to_string());
        }
        if self.continuous {
            props.insert("continuous".to_string(), "true".to_string());
        }
        props.insert("batch".to_string(), self.batch.to_string());
        if self.active_only {
            props.insert("activeOnly".to_string(), "true".to_string());
        }
        if let Some(filter) = &self.filter {
            props.insert("filter".to_string(), filter.clone());
            if let Some(channels) = &self.channels {
                props.insert("channels".to_string(), channels.clone());
            }
            for (key, value) in &self.filter_params {
                props.insert(key.clone(), value.clone());
            }
        }
        props
    }

    /// The optional JSON body restricting the pull to specific documents.
    pub fn json_body(&self) -> Option<Value> {
        self.doc_ids
            .as_ref()
            .map(|ids| serde_json::json!({ "docIDs": ids }))
    }
}

/// One parsed row of a `changes` / `proposeChanges` body.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEntry {
    pub seq: RemoteSeq,
    pub doc_id: String,
    pub rev_id: String,
    pub flags: RevFlags,
    pub body_size: u64,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangesParseError {
    #[error("changes body is not valid JSON: {0}")]
    Json(String),
    #[error("changes body is not an array")]
    NotAnArray,
    #[error("change row {index} is not an array")]
    RowNotAnArray { index: usize },
}

/// Parses a `changes` body of the shape `[[seq, docID, revID, flags,
/// bodySize], ...]`. Rows may omit trailing fields. An empty array means
/// the feed is caught up.
pub fn parse_changes(body: &[u8]) -> Result<Vec<ChangeEntry>, ChangesParseError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|err| ChangesParseError::Json(err.to_string()))?;
    let Value::Array(rows) = value else {
        return Err(ChangesParseError::NotAnArray);
    };

    let mut entries = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let Value::Array(fields) = row else {
            return Err(ChangesParseError::RowNotAnArray { index });
        };
        entries.push(ChangeEntry {
            seq: fields.first().map(RemoteSeq::from_feed_value).unwrap_or_default(),
            doc_id: fields
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            rev_id: fields
                .get(2)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            flags: RevFlags::from_bits(
                fields.get(3).and_then(Value::as_u64).unwrap_or(0) as u32
            ),
            body_size: fields.get(4).and_then(Value::as_u64).unwrap_or(0),
        });
    }
    Ok(entries)
}
