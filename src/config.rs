//! Pull worker options.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullMode {
    /// Pull until caught up, then stop.
    #[default]
    OneShot,
    /// Keep the subscription open and go idle at caught-up.
    Continuous,
    /// Serve a remote-initiated stream; no caught-up semantics.
    Passive,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullOptions {
    pub mode: PullMode,
    /// Ask the remote for active documents only. Auto-clears once caught up,
    /// which affects the next `subChanges` (i.e. a reconnect), not the
    /// current stream.
    pub skip_deleted: bool,
    /// Require `proposeChanges`; plain `changes` messages are refused.
    pub no_incoming_conflicts: bool,
    pub channels: Vec<String>,
    pub filter: Option<String>,
    pub filter_params: BTreeMap<String, String>,
    pub doc_ids: Option<Vec<String>>,
}

impl PullOptions {
    /// Whether this puller initiated the stream and owns caught-up tracking.
    pub fn active(&self) -> bool {
        self.mode != PullMode::Passive
    }

    pub fn continuous(&self) -> bool {
        self.mode == PullMode::Continuous
    }
}
