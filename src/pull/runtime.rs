//! Thread wiring for the pull worker.
//!
//! One thread per mailbox: the coordinator, the rev finder, the inserter,
//! and a pool of incoming-rev workers sized by `max_active_incoming_revs`.
//! Channel disconnects cascade the shutdown once the coordinator exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::debug;

use crate::config::PullOptions;
use crate::core::rev::DocumentEnded;
use crate::core::{Limits, PullStatus, RemoteSeq, ReplyError};
use crate::proto::{MessageIn, MessageNo, Profile, SubChanges};
use crate::pull::coordinator::{Puller, PullerAction, PullerEvent};
use crate::pull::incoming::{RevParser, RevWork, WorkerContext, run_worker_pool};
use crate::pull::inserter::run_inserter;
use crate::pull::returning::RevBatcher;
use crate::pull::rev_finder::{DocIdSet, FindRevsRequest, run_rev_finder};
use crate::pull::store::{PullStore, SharedPullStore};

/// Outbound half of the message transport, as the coordinator sees it.
pub trait PullTransport: Send {
    fn send_sub_changes(&mut self, request: SubChanges);

    fn respond(&mut self, msg: MessageNo, result: Result<(), ReplyError>);
}

/// Callbacks to the owner of the pull.
pub trait PullDelegate: Send {
    /// The checkpoint advanced; persist it.
    fn update_pull_checkpoint(&mut self, seq: &RemoteSeq);

    /// A revision finished, successfully or with a permanent error.
    fn finished_document(&mut self, doc: DocumentEnded);

    /// The activity level or progress changed.
    fn child_status_changed(&mut self, status: PullStatus);
}

pub struct PullerHandle {
    events: Sender<PullerEvent>,
    status: Arc<Mutex<PullStatus>>,
    shutdown: Arc<AtomicBool>,
    joins: Vec<JoinHandle<()>>,
}

impl PullerHandle {
    pub fn spawn<S, T, D>(
        options: PullOptions,
        limits: Limits,
        store: SharedPullStore<S>,
        parser: Arc<dyn RevParser>,
        transport: T,
        delegate: D,
    ) -> Self
    where
        S: PullStore + 'static,
        T: PullTransport + 'static,
        D: PullDelegate + 'static,
    {
        let doc_ids = DocIdSet::new();
        let returning = RevBatcher::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        let (events_tx, events_rx) = channel::unbounded::<PullerEvent>();
        let (find_tx, find_rx) = channel::unbounded::<FindRevsRequest>();
        let (work_tx, work_rx) = channel::unbounded::<RevWork>();
        let (insert_tx, insert_rx) = channel::unbounded();

        let mut puller = Puller::new(
            options,
            limits.clone(),
            doc_ids.clone(),
            returning.clone(),
        );
        let status = Arc::new(Mutex::new(puller.status()));

        let mut joins = Vec::new();

        {
            let store = store.clone();
            let doc_ids = doc_ids.clone();
            let events = events_tx.clone();
            joins.push(thread::spawn(move || {
                run_rev_finder(find_rx, store, doc_ids, events)
            }));
        }

        {
            let store = store.clone();
            let limits = limits.clone();
            joins.push(thread::spawn(move || run_inserter(insert_rx, store, limits)));
        }

        let context = WorkerContext {
            parser,
            inserter: insert_tx,
            doc_ids,
            events: events_tx.clone(),
            returning,
        };
        for _ in 0..limits.max_active_incoming_revs.max(1) {
            let work_rx = work_rx.clone();
            let context = context.clone();
            joins.push(thread::spawn(move || run_worker_pool(work_rx, context)));
        }

        {
            let status = Arc::clone(&status);
            let shutdown = Arc::clone(&shutdown);
            joins.push(thread::spawn(move || {
                run_coordinator(
                    &mut puller,
                    events_rx,
                    transport,
                    delegate,
                    find_tx,
                    work_tx,
                    status,
                    shutdown,
                );
            }));
        }

        Self {
            events: events_tx,
            status,
            shutdown,
            joins,
        }
    }

    /// Begin an active pull from `since` (none = beginning).
    pub fn start(&self, since: RemoteSeq) {
        let _ = self.events.send(PullerEvent::Start { since });
    }

    /// Deliver an inbound message, routed by its profile.
    pub fn handle_message(&self, msg: MessageIn) {
        let event = match msg.profile {
            Profile::Changes | Profile::ProposeChanges => PullerEvent::Changes(msg),
            Profile::Rev => PullerEvent::Rev(msg),
            Profile::NoRev => PullerEvent::NoRev(msg),
        };
        let _ = self.events.send(event);
    }

    /// Deliver the transport's reply to the `subChanges` request.
    pub fn sub_changes_reply(&self, result: Result<(), ReplyError>) {
        let _ = self.events.send(PullerEvent::SubChangesReply { result });
    }

    /// Report that the transport connection is gone.
    pub fn disconnected(&self) {
        let _ = self.events.send(PullerEvent::Disconnected);
    }

    /// Last observed status; pushed updates also arrive through the
    /// delegate.
    pub fn status(&self) -> PullStatus {
        *self.status.lock().expect("status lock poisoned")
    }

    /// Stops the coordinator, lets in-flight workers drain, and joins every
    /// thread.
    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.events.send(PullerEvent::Disconnected);
        drop(self.events);
        for join in self.joins {
            let _ = join.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_coordinator<T, D>(
    puller: &mut Puller,
    events: Receiver<PullerEvent>,
    mut transport: T,
    mut delegate: D,
    find_tx: Sender<FindRevsRequest>,
    work_tx: Sender<RevWork>,
    status: Arc<Mutex<PullStatus>>,
    shutdown: Arc<AtomicBool>,
) where
    T: PullTransport,
    D: PullDelegate,
{
    let mut last_status = puller.status();

    while let Ok(event) = events.recv() {
        for action in puller.handle_event(event) {
            match action {
                PullerAction::SendSubChanges(request) => transport.send_sub_changes(request),
                PullerAction::Respond { msg, result } => transport.respond(msg, result),
                PullerAction::FindRevs { msg, entries } => {
                    let _ = find_tx.send(FindRevsRequest { msg, entries });
                }
                PullerAction::StartRev { worker, msg } => {
                    let _ = work_tx.send(RevWork { worker, msg });
                }
                PullerAction::UpdateCheckpoint(seq) => delegate.update_pull_checkpoint(&seq),
                PullerAction::FinishedDocument(doc) => delegate.finished_document(*doc),
            }
        }

        let current = puller.status();
        if current != last_status {
            last_status = current;
            *status.lock().expect("status lock poisoned") = current;
            delegate.child_status_changed(current);
        }

        if shutdown.load(Ordering::Relaxed) {
            break;
        }
    }
    debug!("pull coordinator mailbox closed");
}
