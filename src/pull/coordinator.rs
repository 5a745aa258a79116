//! Pull coordinator: the client-side state machine of the replication pull.
//!
//! The coordinator is synchronous and single-threaded: events arrive from
//! its mailbox one at a time, and every side effect is returned as an action
//! for the runtime to perform. Counters, ingress queues, the missing set,
//! and the spare worker pool are all private to it.

use std::collections::VecDeque;

use tracing::{debug, info, warn};

use crate::config::{PullMode, PullOptions};
use crate::core::rev::DocumentEnded;
use crate::core::{
    ActivityLevel, Limits, Progress, PullStatus, RemoteSeq, ReplyError, StoreError,
};
use crate::proto::{ChangeEntry, MessageIn, MessageNo, Profile, SubChanges, parse_changes};
use crate::pull::incoming::IncomingRev;
use crate::pull::missing::MissingSequenceSet;
use crate::pull::returning::RevBatcher;
use crate::pull::rev_finder::DocIdSet;

#[derive(Debug)]
pub enum PullerEvent {
    /// Begin an active pull from `since` (none = beginning of the feed).
    Start { since: RemoteSeq },
    /// The transport's reply to our `subChanges` request.
    SubChangesReply { result: Result<(), ReplyError> },
    /// An inbound `changes` or `proposeChanges` message.
    Changes(MessageIn),
    /// An inbound `rev` message.
    Rev(MessageIn),
    /// An inbound `norev` message.
    NoRev(MessageIn),
    /// Rev-finder callback: which announced changes the store is missing.
    RevsFound {
        msg: MessageNo,
        entries: Vec<ChangeEntry>,
        which: Vec<bool>,
    },
    RevFinderFailed {
        msg: MessageNo,
        error: StoreError,
    },
    /// A worker's revision was written inside the open transaction.
    RevProvisionallyHandled,
    /// A generation of finished workers is ready on the returning batcher.
    RevsFinished { generation: u64 },
    /// The transport connection is gone.
    Disconnected,
}

#[derive(Debug, PartialEq)]
pub enum PullerAction {
    SendSubChanges(SubChanges),
    Respond {
        msg: MessageNo,
        result: Result<(), ReplyError>,
    },
    FindRevs {
        msg: MessageNo,
        entries: Vec<ChangeEntry>,
    },
    StartRev {
        worker: IncomingRev,
        msg: MessageIn,
    },
    UpdateCheckpoint(RemoteSeq),
    FinishedDocument(Box<DocumentEnded>),
}

/// Snapshot of the coordinator's counters, for observability and tests.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PullerCounters {
    pub pending_rev_messages: u32,
    pub active_incoming_revs: u32,
    pub unfinished_incoming_revs: u32,
    pub pending_rev_finder_calls: u32,
    pub waiting_changes: usize,
    pub waiting_revs: usize,
    pub spare_workers: usize,
    pub missing_sequences: usize,
}

pub struct Puller {
    options: PullOptions,
    limits: Limits,
    doc_ids: DocIdSet,
    returning: RevBatcher<IncomingRev>,

    missing: MissingSequenceSet,
    last_sequence: RemoteSeq,
    waiting_changes: VecDeque<MessageIn>,
    waiting_revs: VecDeque<MessageIn>,
    spare: Vec<IncomingRev>,

    pending_rev_messages: u32,
    active_incoming_revs: u32,
    unfinished_incoming_revs: u32,
    pending_rev_finder_calls: u32,
    pending_sub_changes: u32,

    skip_deleted: bool,
    caught_up: bool,
    fatal_error: bool,
    connected: bool,
    progress: Progress,
}

impl Puller {
    pub fn new(
        options: PullOptions,
        limits: Limits,
        doc_ids: DocIdSet,
        returning: RevBatcher<IncomingRev>,
    ) -> Self {
        let skip_deleted = options.skip_deleted;
        if options.active() && options.no_incoming_conflicts {
            warn!("no_incoming_conflicts is not compatible with active pull replications");
        }
        Self {
            spare: Vec::with_capacity(limits.max_active_incoming_revs as usize),
            options,
            limits,
            doc_ids,
            returning,
            missing: MissingSequenceSet::new(),
            last_sequence: RemoteSeq::none(),
            waiting_changes: VecDeque::new(),
            waiting_revs: VecDeque::new(),
            pending_rev_messages: 0,
            active_incoming_revs: 0,
            unfinished_incoming_revs: 0,
            pending_rev_finder_calls: 0,
            pending_sub_changes: 0,
            skip_deleted,
            caught_up: false,
            fatal_error: false,
            connected: true,
            progress: Progress::default(),
        }
    }

    pub fn handle_event(&mut self, event: PullerEvent) -> Vec<PullerAction> {
        let mut actions = Vec::new();
        match event {
            PullerEvent::Start { since } => self.start(since, &mut actions),
            PullerEvent::SubChangesReply { result } => {
                self.pending_sub_changes = self.pending_sub_changes.saturating_sub(1);
                if let Err(err) = result {
                    warn!("subChanges request failed: {err}");
                    self.fatal_error = true;
                }
            }
            PullerEvent::Changes(msg) => self.handle_changes(msg, &mut actions),
            PullerEvent::Rev(msg) => self.handle_rev(msg, &mut actions),
            PullerEvent::NoRev(msg) => self.handle_no_rev(msg, &mut actions),
            PullerEvent::RevsFound { msg, entries, which } => {
                self.handle_revs_found(msg, entries, which, &mut actions);
            }
            PullerEvent::RevFinderFailed { msg, error } => {
                self.pending_rev_finder_calls = self.pending_rev_finder_calls.saturating_sub(1);
                actions.push(PullerAction::Respond {
                    msg,
                    result: Err(ReplyError::internal(error.to_string())),
                });
            }
            PullerEvent::RevProvisionallyHandled => {
                self.active_incoming_revs = self.active_incoming_revs.saturating_sub(1);
                self.pump_revs(&mut actions);
            }
            PullerEvent::RevsFinished { generation } => {
                self.revs_finished(generation, &mut actions);
            }
            PullerEvent::Disconnected => {
                self.connected = false;
            }
        }
        actions
    }

    /// Current status. Evaluating it while the pull is idle releases the
    /// spare pool.
    pub fn status(&mut self) -> PullStatus {
        PullStatus {
            level: self.compute_activity_level(),
            progress: self.progress,
        }
    }

    pub fn counters(&self) -> PullerCounters {
        PullerCounters {
            pending_rev_messages: self.pending_rev_messages,
            active_incoming_revs: self.active_incoming_revs,
            unfinished_incoming_revs: self.unfinished_incoming_revs,
            pending_rev_finder_calls: self.pending_rev_finder_calls,
            waiting_changes: self.waiting_changes.len(),
            waiting_revs: self.waiting_revs.len(),
            spare_workers: self.spare.len(),
            missing_sequences: self.missing.len(),
        }
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    pub fn caught_up(&self) -> bool {
        self.caught_up
    }

    pub fn last_sequence(&self) -> &RemoteSeq {
        &self.last_sequence
    }

    fn start(&mut self, since: RemoteSeq, actions: &mut Vec<PullerAction>) {
        self.last_sequence = since.clone();
        self.missing.clear(since);
        info!("starting pull from remote seq '{}'", self.last_sequence);

        let request = SubChanges::from_options(
            &self.options,
            self.last_sequence.clone(),
            self.limits.changes_batch_size,
            self.skip_deleted,
        );
        self.pending_sub_changes += 1;
        actions.push(PullerAction::SendSubChanges(request));
    }

    fn handle_changes(&mut self, msg: MessageIn, actions: &mut Vec<PullerAction>) {
        debug!(
            "received '{}' #{} ({} queued; {} revs pending, {} active, {} unfinished)",
            msg.profile.as_str(),
            msg.number,
            self.waiting_changes.len(),
            self.pending_rev_messages,
            self.active_incoming_revs,
            self.unfinished_incoming_revs
        );
        self.waiting_changes.push_back(msg);
        self.pump_changes(actions);
    }

    /// Drains queued `changes` messages while flow control allows.
    fn pump_changes(&mut self, actions: &mut Vec<PullerAction>) {
        while self.pending_rev_messages < self.limits.max_pending_revs {
            let Some(msg) = self.waiting_changes.pop_front() else {
                break;
            };
            self.handle_changes_now(msg, actions);
        }
    }

    fn handle_changes_now(&mut self, msg: MessageIn, actions: &mut Vec<PullerAction>) {
        let proposed = msg.profile == Profile::ProposeChanges;

        let entries = match parse_changes(&msg.body) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("invalid body of '{}' message: {err}", msg.profile.as_str());
                if !msg.no_reply {
                    actions.push(PullerAction::Respond {
                        msg: msg.number,
                        result: Err(ReplyError::bad_request("Invalid JSON body")),
                    });
                }
                return;
            }
        };

        if entries.is_empty() {
            info!("caught up with remote changes");
            self.caught_up = true;
            self.skip_deleted = false;
            if !msg.no_reply {
                actions.push(PullerAction::Respond {
                    msg: msg.number,
                    result: Ok(()),
                });
            }
            return;
        }

        if msg.no_reply {
            warn!("ignoring pointless noreply '{}' message", msg.profile.as_str());
            return;
        }

        if self.options.no_incoming_conflicts && !proposed {
            // Conflict-free mode requires the remote to propose instead.
            actions.push(PullerAction::Respond {
                msg: msg.number,
                result: Err(ReplyError::conflict("proposeChanges required")),
            });
            return;
        }

        self.pending_rev_finder_calls += 1;
        actions.push(PullerAction::FindRevs {
            msg: msg.number,
            entries,
        });
    }

    fn handle_revs_found(
        &mut self,
        msg: MessageNo,
        entries: Vec<ChangeEntry>,
        which: Vec<bool>,
        actions: &mut Vec<PullerAction>,
    ) {
        self.pending_rev_finder_calls = self.pending_rev_finder_calls.saturating_sub(1);

        for (i, entry) in entries.into_iter().enumerate() {
            let wanted = which.get(i).copied().unwrap_or(false);
            if self.options.active() {
                let body_size = if wanted { entry.body_size.max(1) } else { 0 };
                if entry.seq.is_none() {
                    warn!("empty sequence in 'changes' message for '{}'", entry.doc_id);
                } else {
                    self.missing.add(entry.seq.clone(), body_size);
                }
                self.progress.total += body_size;
                if !wanted {
                    self.completed_sequence(&entry.seq, false, true, actions);
                }
            }
            if wanted {
                self.pending_rev_messages += 1;
            }
        }

        if self.options.active() {
            debug!(
                "now waiting for {} 'rev' messages; {} known sequences pending",
                self.pending_rev_messages,
                self.missing.len()
            );
        }
        actions.push(PullerAction::Respond {
            msg,
            result: Ok(()),
        });
    }

    fn handle_rev(&mut self, msg: MessageIn, actions: &mut Vec<PullerAction>) {
        if self.active_incoming_revs < self.limits.max_active_incoming_revs
            && self.unfinished_incoming_revs < self.limits.max_unfinished_incoming_revs
        {
            self.start_incoming_rev(msg, actions);
        } else {
            debug!(
                "delaying 'rev' message for '{}' [{} waiting]",
                msg.property("id").unwrap_or_default(),
                self.waiting_revs.len() + 1
            );
            self.waiting_revs.push_back(msg);
        }
    }

    fn handle_no_rev(&mut self, msg: MessageIn, actions: &mut Vec<PullerAction>) {
        if let Some(doc_id) = msg.property("id") {
            self.doc_ids.remove(doc_id);
        }
        self.pending_rev_messages = self.pending_rev_messages.saturating_sub(1);
        if let Some(seq) = msg.property("sequence") {
            let seq = RemoteSeq::new(seq);
            if !seq.is_none() {
                self.completed_sequence(&seq, false, true, actions);
            }
        }
        self.pump_changes(actions);
        if !msg.no_reply {
            actions.push(PullerAction::Respond {
                msg: msg.number,
                result: Ok(()),
            });
        }
    }

    fn start_incoming_rev(&mut self, msg: MessageIn, actions: &mut Vec<PullerAction>) {
        self.pending_rev_messages = self.pending_rev_messages.saturating_sub(1);
        self.active_incoming_revs += 1;
        self.unfinished_incoming_revs += 1;
        let worker = self.spare.pop().unwrap_or_default();
        actions.push(PullerAction::StartRev { worker, msg });
        self.pump_changes(actions);
    }

    /// Drains queued `rev` messages while both worker caps have room.
    fn pump_revs(&mut self, actions: &mut Vec<PullerAction>) {
        while self.active_incoming_revs < self.limits.max_active_incoming_revs
            && self.unfinished_incoming_revs < self.limits.max_unfinished_incoming_revs
        {
            let Some(msg) = self.waiting_revs.pop_front() else {
                break;
            };
            self.start_incoming_rev(msg, actions);
        }
    }

    fn revs_finished(&mut self, generation: u64, actions: &mut Vec<PullerAction>) {
        let finished = self.returning.pop(generation);
        if finished.is_empty() {
            return;
        }
        let batch_size = finished.len() as u32;

        for worker in &finished {
            if !worker.was_provisionally_inserted() {
                // The worker failed before staging; its active slot is still
                // held.
                self.active_incoming_revs = self.active_incoming_revs.saturating_sub(1);
                self.pump_revs(actions);
            }
            if self.options.active() {
                let seq = worker.remote_seq().clone();
                self.completed_sequence(&seq, worker.error_is_transient(), false, actions);
            }
            if !worker.message_no_reply() {
                let result = match &worker.rev().error {
                    Some(err) => Err(err.to_reply()),
                    None => Ok(()),
                };
                actions.push(PullerAction::Respond {
                    msg: worker.message_no(),
                    result,
                });
            }
            actions.push(PullerAction::FinishedDocument(Box::new(
                worker.to_document_ended(),
            )));
        }

        self.unfinished_incoming_revs =
            self.unfinished_incoming_revs.saturating_sub(batch_size);

        if self.options.active() {
            self.update_last_sequence(actions);
        }

        let capacity =
            (self.limits.max_active_incoming_revs as usize).saturating_sub(self.spare.len());
        for mut worker in finished.into_iter().take(capacity) {
            worker.reset();
            self.spare.push(worker);
        }

        self.pump_revs(actions);
        self.pump_changes(actions);
    }

    /// Records that a sequence has been pulled. A transient error keeps the
    /// sequence in the missing set for a future pull while still counting
    /// its bytes toward completed progress.
    fn completed_sequence(
        &mut self,
        seq: &RemoteSeq,
        with_transient_error: bool,
        should_update: bool,
        actions: &mut Vec<PullerAction>,
    ) {
        let body_size = if with_transient_error {
            self.missing.body_size_of(seq)
        } else {
            let (was_earliest, body_size) = self.missing.remove(seq);
            if was_earliest && should_update {
                self.update_last_sequence(actions);
            }
            body_size
        };
        self.progress.completed += body_size;
    }

    fn update_last_sequence(&mut self, actions: &mut Vec<PullerAction>) {
        let since = self.missing.since();
        if since != self.last_sequence {
            self.last_sequence = since.clone();
            debug!("checkpoint now at '{}'", self.last_sequence);
            actions.push(PullerAction::UpdateCheckpoint(since));
        }
    }

    fn compute_activity_level(&mut self) -> ActivityLevel {
        if self.fatal_error || !self.connected {
            ActivityLevel::Stopped
        } else if self.pending_sub_changes > 0
            || (!self.caught_up && self.options.active())
            || self.pending_rev_messages > 0
            || self.unfinished_incoming_revs > 0
            || self.pending_rev_finder_calls > 0
        {
            ActivityLevel::Busy
        } else if self.options.continuous() || self.options.mode == PullMode::Passive {
            self.spare.clear();
            ActivityLevel::Idle
        } else {
            ActivityLevel::Stopped
        }
    }
}
