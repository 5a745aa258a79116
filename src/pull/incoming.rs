//! Incoming-revision workers: parse, stage, and report one pulled revision.

use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use tracing::warn;

use crate::core::rev::{DocumentEnded, ParsedRev, PulledRev, RevFlags};
use crate::core::{RemoteSeq, RevError};
use crate::proto::{MessageIn, MessageNo};
use crate::pull::coordinator::PullerEvent;
use crate::pull::inserter::{InsertRequest, InsertSignal};
use crate::pull::rev_finder::DocIdSet;
use crate::pull::returning::RevBatcher;

/// Decodes a `rev` message body into an insertable revision. Conflict
/// resolution and body validation live behind this trait, outside the pull
/// pipeline.
pub trait RevParser: Send + Sync {
    fn parse_rev(&self, msg: &MessageIn) -> Result<ParsedRev, RevError>;
}

/// State of one in-flight revision. Reusable: after its final report is
/// drained the coordinator resets it and keeps it in the spare pool.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct IncomingRev {
    rev: PulledRev,
    body_size: u64,
    msg_no: MessageNo,
    msg_no_reply: bool,
    provisionally_inserted: bool,
}

impl IncomingRev {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads this worker with a `rev` message. Clears any state left from a
    /// previous revision.
    pub fn begin(&mut self, msg: &MessageIn) {
        self.rev = PulledRev {
            doc_id: msg.property("id").unwrap_or_default().to_string(),
            rev_id: msg.property("rev").unwrap_or_default().to_string(),
            flags: if msg.property("deleted").is_some() {
                RevFlags::DELETED
            } else {
                RevFlags::NONE
            },
            remote_seq: msg
                .property("sequence")
                .map(RemoteSeq::new)
                .unwrap_or_default(),
            error: None,
        };
        self.body_size = msg.body.len() as u64;
        self.msg_no = msg.number;
        self.msg_no_reply = msg.no_reply;
        self.provisionally_inserted = false;
    }

    pub fn rev(&self) -> &PulledRev {
        &self.rev
    }

    pub fn remote_seq(&self) -> &RemoteSeq {
        &self.rev.remote_seq
    }

    pub fn body_size(&self) -> u64 {
        self.body_size
    }

    pub fn message_no(&self) -> MessageNo {
        self.msg_no
    }

    pub fn message_no_reply(&self) -> bool {
        self.msg_no_reply
    }

    pub fn was_provisionally_inserted(&self) -> bool {
        self.provisionally_inserted
    }

    pub fn error_is_transient(&self) -> bool {
        self.rev.error_is_transient()
    }

    pub fn to_document_ended(&self) -> DocumentEnded {
        self.rev.to_document_ended()
    }

    pub fn set_provisional(&mut self) {
        self.provisionally_inserted = true;
    }

    pub fn fail(&mut self, error: RevError) {
        self.rev.error = Some(error);
    }

    /// Returns the worker to its blank state before it re-enters the spare
    /// pool.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Everything a pool thread needs to process revisions.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub parser: Arc<dyn RevParser>,
    pub inserter: Sender<InsertRequest>,
    pub doc_ids: DocIdSet,
    pub events: Sender<PullerEvent>,
    pub returning: RevBatcher<IncomingRev>,
}

pub(crate) struct RevWork {
    pub worker: IncomingRev,
    pub msg: MessageIn,
}

/// Pool thread body. Each revision runs to its final report, then the worker
/// object rides the returning batcher back to the coordinator.
pub(crate) fn run_worker_pool(work: Receiver<RevWork>, ctx: WorkerContext) {
    while let Ok(RevWork { mut worker, msg }) = work.recv() {
        process_rev(&mut worker, &msg, &ctx);
        ctx.doc_ids.remove(&worker.rev().doc_id);
        if let Some(generation) = ctx.returning.push(worker) {
            let _ = ctx.events.send(PullerEvent::RevsFinished { generation });
        }
    }
}

pub(crate) fn process_rev(worker: &mut IncomingRev, msg: &MessageIn, ctx: &WorkerContext) {
    worker.begin(msg);

    let parsed = match ctx.parser.parse_rev(msg) {
        Ok(parsed) => parsed,
        Err(err) => {
            warn!(
                "failed to parse rev '{}' {}: {err}",
                worker.rev().doc_id,
                worker.rev().rev_id
            );
            worker.fail(err);
            return;
        }
    };

    let (signal_tx, signal_rx) = crossbeam::channel::bounded(2);
    if ctx
        .inserter
        .send(InsertRequest {
            rev: parsed,
            signals: signal_tx,
        })
        .is_err()
    {
        worker.fail(RevError::new(500, "inserter unavailable", true));
        return;
    }

    loop {
        match signal_rx.recv() {
            Ok(InsertSignal::Provisional) => {
                worker.set_provisional();
                let _ = ctx.events.send(PullerEvent::RevProvisionallyHandled);
            }
            Ok(InsertSignal::Committed(result)) => {
                if let Err(err) = result {
                    worker.fail(err);
                }
                return;
            }
            Err(_) => {
                worker.fail(RevError::new(500, "inserter dropped revision", true));
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Profile;
    use bytes::Bytes;

    fn rev_message() -> MessageIn {
        MessageIn::new(Profile::Rev, 3)
            .with_property("id", "doc1")
            .with_property("rev", "1-abc")
            .with_property("sequence", "101")
            .with_body(Bytes::from_static(b"{\"k\":1}"))
    }

    struct OkParser;

    impl RevParser for OkParser {
        fn parse_rev(&self, msg: &MessageIn) -> Result<ParsedRev, RevError> {
            Ok(ParsedRev {
                doc_id: msg.property("id").unwrap_or_default().to_string(),
                rev_id: msg.property("rev").unwrap_or_default().to_string(),
                history: Vec::new(),
                deleted: false,
                body: msg.body.clone(),
            })
        }
    }

    struct FailParser;

    impl RevParser for FailParser {
        fn parse_rev(&self, _msg: &MessageIn) -> Result<ParsedRev, RevError> {
            Err(RevError::new(400, "bad rev body", false))
        }
    }

    fn context(parser: Arc<dyn RevParser>) -> (WorkerContext, Receiver<InsertRequest>, Receiver<PullerEvent>) {
        let (insert_tx, insert_rx) = crossbeam::channel::unbounded();
        let (event_tx, event_rx) = crossbeam::channel::unbounded();
        (
            WorkerContext {
                parser,
                inserter: insert_tx,
                doc_ids: DocIdSet::new(),
                events: event_tx,
                returning: RevBatcher::new(),
            },
            insert_rx,
            event_rx,
        )
    }

    #[test]
    fn begin_reads_message_headers() {
        let mut worker = IncomingRev::new();
        worker.begin(&rev_message().with_property("deleted", "1"));
        assert_eq!(worker.rev().doc_id, "doc1");
        assert_eq!(worker.rev().rev_id, "1-abc");
        assert_eq!(worker.remote_seq(), &RemoteSeq::new("101"));
        assert!(worker.rev().deleted());
        assert_eq!(worker.body_size(), 7);
        assert_eq!(worker.message_no(), 3);
        assert!(!worker.was_provisionally_inserted());
    }

    #[test]
    fn reset_clears_previous_revision_state() {
        let mut worker = IncomingRev::new();
        worker.begin(&rev_message());
        worker.fail(RevError::new(500, "boom", true));
        worker.set_provisional();

        worker.reset();
        assert!(worker.rev().doc_id.is_empty());
        assert!(worker.rev().error.is_none());
        assert!(!worker.was_provisionally_inserted());
    }

    #[test]
    fn happy_path_reports_provisional_then_stages_the_body() {
        let (ctx, insert_rx, event_rx) = context(Arc::new(OkParser));
        let mut worker = IncomingRev::new();
        let msg = rev_message();

        let join = std::thread::spawn(move || {
            process_rev(&mut worker, &msg, &ctx);
            worker
        });

        let staged = insert_rx.recv().unwrap();
        assert_eq!(staged.rev.doc_id, "doc1");
        staged.signals.send(InsertSignal::Provisional).unwrap();
        staged.signals.send(InsertSignal::Committed(Ok(()))).unwrap();

        let worker = join.join().unwrap();
        assert!(worker.was_provisionally_inserted());
        assert!(worker.rev().error.is_none());
        assert!(matches!(
            event_rx.recv().unwrap(),
            PullerEvent::RevProvisionallyHandled
        ));
    }

    #[test]
    fn parse_failure_skips_insertion() {
        let (ctx, insert_rx, _event_rx) = context(Arc::new(FailParser));
        let mut worker = IncomingRev::new();
        process_rev(&mut worker, &rev_message(), &ctx);

        assert!(insert_rx.is_empty());
        assert!(!worker.was_provisionally_inserted());
        let error = worker.rev().error.as_ref().unwrap();
        assert_eq!(error.code, 400);
        assert!(!error.transient);
    }
}
