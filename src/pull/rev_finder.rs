//! Rev-finder worker: filters announced changes through the local store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender};
use tracing::warn;

use crate::proto::{ChangeEntry, MessageNo};
use crate::pull::coordinator::PullerEvent;
use crate::pull::store::PullStore;

/// Concurrent multiset of document IDs with a revision currently in flight.
/// Shared between the coordinator and the rev finder; the same document can
/// be announced more than once, so membership is counted.
#[derive(Clone, Debug, Default)]
pub struct DocIdSet {
    inner: Arc<Mutex<HashMap<String, u32>>>,
}

impl DocIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, doc_id: &str) {
        let mut inner = self.lock();
        *inner.entry(doc_id.to_string()).or_insert(0) += 1;
    }

    /// Drops one occurrence. Removing an absent ID is a no-op.
    pub fn remove(&self, doc_id: &str) {
        let mut inner = self.lock();
        if let Some(count) = inner.get_mut(doc_id) {
            *count -= 1;
            if *count == 0 {
                inner.remove(doc_id);
            }
        }
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.lock().contains_key(doc_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.inner.lock().expect("doc id set lock poisoned")
    }
}

pub(crate) struct FindRevsRequest {
    pub msg: MessageNo,
    pub entries: Vec<ChangeEntry>,
}

/// Mailbox loop of the rev-finder worker. Requests complete in FIFO order,
/// so callbacks for consecutive `changes` messages stay ordered.
pub(crate) fn run_rev_finder<S: PullStore>(
    requests: Receiver<FindRevsRequest>,
    mut store: S,
    doc_ids: DocIdSet,
    events: Sender<PullerEvent>,
) {
    while let Ok(request) = requests.recv() {
        match store.missing_revs(&request.entries) {
            Ok(which) => {
                for (entry, wanted) in request.entries.iter().zip(&which) {
                    if *wanted {
                        doc_ids.add(&entry.doc_id);
                    }
                }
                let _ = events.send(PullerEvent::RevsFound {
                    msg: request.msg,
                    entries: request.entries,
                    which,
                });
            }
            Err(error) => {
                warn!("rev lookup failed for changes #{}: {error}", request.msg);
                let _ = events.send(PullerEvent::RevFinderFailed {
                    msg: request.msg,
                    error,
                });
            }
        }
    }
}
