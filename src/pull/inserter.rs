//! Batched revision insertion worker.

use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, Sender};
use tracing::{debug, warn};

use crate::core::{Limits, ParsedRev, RevError};
use crate::pull::store::PullStore;

pub(crate) struct InsertRequest {
    pub rev: ParsedRev,
    pub signals: Sender<InsertSignal>,
}

/// Signals back to the staging worker: `Provisional` once the revision is
/// written inside the open transaction, `Committed` once the transaction
/// resolves.
#[derive(Debug)]
pub(crate) enum InsertSignal {
    Provisional,
    Committed(Result<(), RevError>),
}

/// Mailbox loop of the inserter worker. Revisions from many incoming-rev
/// workers coalesce into one store transaction per latency window.
pub(crate) fn run_inserter<S: PullStore>(requests: Receiver<InsertRequest>, mut store: S, limits: Limits) {
    while let Ok(first) = requests.recv() {
        let mut batch = vec![first];
        let deadline = Instant::now() + Duration::from_millis(limits.insert_batch_latency_ms);
        while batch.len() < limits.insert_batch_events {
            match requests.recv_deadline(deadline) {
                Ok(request) => batch.push(request),
                Err(_) => break,
            }
        }
        insert_batch(&mut store, batch);
    }
}

fn insert_batch<S: PullStore>(store: &mut S, batch: Vec<InsertRequest>) {
    debug!("inserting {} revisions", batch.len());

    if let Err(err) = store.begin_insert() {
        warn!("could not open insertion transaction: {err}");
        let failure = err.into_rev_error();
        for request in batch {
            let _ = request
                .signals
                .send(InsertSignal::Committed(Err(failure.clone())));
        }
        return;
    }

    let mut staged: Vec<Option<RevError>> = Vec::with_capacity(batch.len());
    for request in &batch {
        match store.insert_revision(&request.rev) {
            Ok(()) => {
                let _ = request.signals.send(InsertSignal::Provisional);
                staged.push(None);
            }
            Err(err) => {
                warn!(
                    "insert of '{}' {} failed: {err}",
                    request.rev.doc_id, request.rev.rev_id
                );
                staged.push(Some(err));
            }
        }
    }

    let commit = store.commit_insert();
    if let Err(err) = &commit {
        warn!("insertion transaction failed to commit: {err}");
    }

    for (request, insert_error) in batch.into_iter().zip(staged) {
        let outcome = match (&commit, insert_error) {
            (Err(err), _) => Err(err.clone().into_rev_error()),
            (Ok(()), Some(err)) => Err(err),
            (Ok(()), None) => Ok(()),
        };
        let _ = request.signals.send(InsertSignal::Committed(outcome));
    }
}
