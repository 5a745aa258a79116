//! Flow-control caps and batching tuning (normative defaults).

use serde::{Deserialize, Serialize};

/// The three caps are the only memory-governing knobs of the pull pipeline;
/// everything else here tunes batching behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Cap on `rev` messages requested from the remote but not yet arrived.
    pub max_pending_revs: u32,
    /// Cap on incoming-rev workers currently parsing or staging. Also bounds
    /// the worker pool and the spare pool.
    pub max_active_incoming_revs: u32,
    /// Cap on incoming-rev workers staged but not yet committed.
    pub max_unfinished_incoming_revs: u32,

    /// Batch-size hint sent in the `subChanges` request.
    pub changes_batch_size: u32,

    /// Max revisions the inserter commits in one store transaction.
    pub insert_batch_events: usize,
    /// How long the inserter waits to fill a batch before committing.
    pub insert_batch_latency_ms: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_pending_revs: 200,
            max_active_incoming_revs: 12,
            max_unfinished_incoming_revs: 100,
            changes_batch_size: 200,
            insert_batch_events: 100,
            insert_batch_latency_ms: 250,
        }
    }
}
