//! End-to-end pull scenarios driven against the coordinator state machine.

use bytes::Bytes;

use riptide::{
    ActivityLevel, DocIdSet, IncomingRev, Limits, MessageIn, MessageNo, Profile, PullMode,
    PullOptions, Puller, PullerAction, PullerEvent, RemoteSeq, RevBatcher, RevError,
    proto::parse_changes,
};

fn puller_with(options: PullOptions, limits: Limits) -> (Puller, RevBatcher<IncomingRev>) {
    let returning = RevBatcher::new();
    let puller = Puller::new(options, limits, DocIdSet::new(), returning.clone());
    (puller, returning)
}

fn started_puller(options: PullOptions, since: &str) -> (Puller, RevBatcher<IncomingRev>) {
    let (mut puller, returning) = puller_with(options, Limits::default());
    puller.handle_event(PullerEvent::Start {
        since: RemoteSeq::new(since),
    });
    puller.handle_event(PullerEvent::SubChangesReply { result: Ok(()) });
    (puller, returning)
}

fn changes_msg(number: MessageNo, body: &str) -> MessageIn {
    MessageIn::new(Profile::Changes, number).with_body(Bytes::from(body.to_string()))
}

fn rev_msg(number: MessageNo, doc_id: &str, rev_id: &str, seq: &str) -> MessageIn {
    MessageIn::new(Profile::Rev, number)
        .with_property("id", doc_id)
        .with_property("rev", rev_id)
        .with_property("sequence", seq)
}

/// Feeds a `changes` body and its rev-finder verdict, returning the actions
/// of the callback step.
fn announce(puller: &mut Puller, number: MessageNo, body: &str, which: Vec<bool>) -> Vec<PullerAction> {
    let actions = puller.handle_event(PullerEvent::Changes(changes_msg(number, body)));
    assert!(
        actions
            .iter()
            .any(|action| matches!(action, PullerAction::FindRevs { .. })),
        "changes message was not forwarded to the rev finder: {actions:?}"
    );
    let entries = parse_changes(body.as_bytes()).unwrap();
    puller.handle_event(PullerEvent::RevsFound {
        msg: number,
        entries,
        which,
    })
}

/// Runs one announced rev through a worker to its final report.
fn complete_rev(
    puller: &mut Puller,
    returning: &RevBatcher<IncomingRev>,
    msg: MessageIn,
    error: Option<RevError>,
) -> Vec<PullerAction> {
    let actions = puller.handle_event(PullerEvent::Rev(msg.clone()));
    let mut worker = actions
        .into_iter()
        .find_map(|action| match action {
            PullerAction::StartRev { worker, .. } => Some(worker),
            _ => None,
        })
        .expect("rev message should start a worker");

    worker.begin(&msg);
    match error {
        None => {
            worker.set_provisional();
            puller.handle_event(PullerEvent::RevProvisionallyHandled);
        }
        Some(err) => worker.fail(err),
    }

    let generation = returning.push(worker).expect("a drain should be scheduled");
    puller.handle_event(PullerEvent::RevsFinished { generation })
}

#[test]
fn trivial_pull_catches_up_and_stops() {
    let (mut puller, _returning) = started_puller(PullOptions::default(), "100");
    assert_eq!(puller.status().level, ActivityLevel::Busy);

    let actions = puller.handle_event(PullerEvent::Changes(changes_msg(1, "[]")));
    assert!(matches!(
        &actions[..],
        [PullerAction::Respond { msg: 1, result: Ok(()) }]
    ));

    assert!(puller.caught_up());
    assert_eq!(puller.last_sequence(), &RemoteSeq::new("100"));
    assert_eq!(puller.status().level, ActivityLevel::Stopped);
}

#[test]
fn trivial_continuous_pull_goes_idle() {
    let options = PullOptions {
        mode: PullMode::Continuous,
        ..PullOptions::default()
    };
    let (mut puller, _returning) = started_puller(options, "100");
    puller.handle_event(PullerEvent::Changes(changes_msg(1, "[]")));
    assert_eq!(puller.status().level, ActivityLevel::Idle);
}

#[test]
fn single_document_happy_path_advances_the_checkpoint() {
    let (mut puller, returning) = started_puller(PullOptions::default(), "100");

    announce(&mut puller, 1, r#"[["101","doc1","1-abc",0,500]]"#, vec![true]);
    assert_eq!(puller.counters().pending_rev_messages, 1);
    assert_eq!(puller.progress().total, 500);

    let actions = complete_rev(&mut puller, &returning, rev_msg(2, "doc1", "1-abc", "101"), None);

    assert!(actions.contains(&PullerAction::UpdateCheckpoint(RemoteSeq::new("101"))));
    let finished: Vec<_> = actions
        .iter()
        .filter_map(|action| match action {
            PullerAction::FinishedDocument(doc) => Some(doc),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].doc_id, "doc1");
    assert!(finished[0].error.is_none());
    assert!(actions.contains(&PullerAction::Respond {
        msg: 2,
        result: Ok(()),
    }));

    assert_eq!(puller.last_sequence(), &RemoteSeq::new("101"));
    assert_eq!(puller.progress().completed, 500);
    assert_eq!(puller.counters().unfinished_incoming_revs, 0);
}

#[test]
fn out_of_order_completion_waits_for_the_earliest_sequence() {
    let (mut puller, returning) = started_puller(PullOptions::default(), "100");

    announce(
        &mut puller,
        1,
        r#"[["101","doc1","1-a",0,100],["102","doc2","1-b",0,200]]"#,
        vec![true, true],
    );

    let actions = complete_rev(&mut puller, &returning, rev_msg(2, "doc2", "1-b", "102"), None);
    assert!(
        !actions
            .iter()
            .any(|action| matches!(action, PullerAction::UpdateCheckpoint(_))),
        "checkpoint must not advance past the pending earliest sequence"
    );
    assert_eq!(puller.last_sequence(), &RemoteSeq::new("100"));

    let actions = complete_rev(&mut puller, &returning, rev_msg(3, "doc1", "1-a", "101"), None);
    assert!(actions.contains(&PullerAction::UpdateCheckpoint(RemoteSeq::new("102"))));
    assert_eq!(puller.last_sequence(), &RemoteSeq::new("102"));
    assert_eq!(puller.counters().missing_sequences, 0);
}

#[test]
fn transient_error_counts_progress_but_keeps_the_sequence() {
    let (mut puller, returning) = started_puller(PullOptions::default(), "100");

    announce(&mut puller, 1, r#"[["101","doc1","1-abc",0,500]]"#, vec![true]);

    let actions = complete_rev(
        &mut puller,
        &returning,
        rev_msg(2, "doc1", "1-abc", "101"),
        Some(RevError::new(500, "db busy", true)),
    );

    assert!(
        !actions
            .iter()
            .any(|action| matches!(action, PullerAction::UpdateCheckpoint(_)))
    );
    assert_eq!(puller.last_sequence(), &RemoteSeq::new("100"));
    assert_eq!(puller.progress().completed, 500);
    assert_eq!(puller.counters().missing_sequences, 1);

    let finished: Vec<_> = actions
        .iter()
        .filter_map(|action| match action {
            PullerAction::FinishedDocument(doc) => Some(doc),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 1);
    assert!(finished[0].error_is_transient);
}

#[test]
fn permanent_error_advances_the_checkpoint_like_a_success() {
    let (mut puller, returning) = started_puller(PullOptions::default(), "100");

    announce(&mut puller, 1, r#"[["101","doc1","1-abc",0,500]]"#, vec![true]);

    let actions = complete_rev(
        &mut puller,
        &returning,
        rev_msg(2, "doc1", "1-abc", "101"),
        Some(RevError::new(403, "forbidden", false)),
    );

    assert!(actions.contains(&PullerAction::UpdateCheckpoint(RemoteSeq::new("101"))));
    assert_eq!(puller.counters().missing_sequences, 0);

    let finished: Vec<_> = actions
        .iter()
        .filter_map(|action| match action {
            PullerAction::FinishedDocument(doc) => Some(doc),
            _ => None,
        })
        .collect();
    assert_eq!(finished.len(), 1);
    let error = finished[0].error.as_ref().expect("error should be reported");
    assert_eq!(error.code, 403);
    assert!(!finished[0].error_is_transient);
}

#[test]
fn not_wanted_entries_complete_immediately() {
    let (mut puller, returning) = started_puller(PullOptions::default(), "100");

    let actions = announce(
        &mut puller,
        1,
        r#"[["101","doc1","1-a",0,100],["102","doc2","1-b",0,200],["103","doc3","1-c",0,300]]"#,
        vec![false, true, false],
    );

    // The not-wanted prefix completes at once and moves the checkpoint.
    assert!(actions.contains(&PullerAction::UpdateCheckpoint(RemoteSeq::new("101"))));
    assert_eq!(puller.counters().pending_rev_messages, 1);
    assert_eq!(puller.progress().total, 200);

    let actions = complete_rev(&mut puller, &returning, rev_msg(2, "doc2", "1-b", "102"), None);
    assert!(actions.contains(&PullerAction::UpdateCheckpoint(RemoteSeq::new("103"))));
    assert_eq!(puller.counters().missing_sequences, 0);
    assert_eq!(puller.progress().completed, 200);
}

#[test]
fn every_started_rev_reports_exactly_one_final_completion() {
    let (mut puller, returning) = started_puller(PullOptions::default(), "100");

    announce(
        &mut puller,
        1,
        r#"[["101","doc1","1-a",0,100],["102","doc2","1-b",0,200]]"#,
        vec![true, true],
    );

    let mut finished = 0usize;
    for (number, (doc, seq)) in [("doc1", "101"), ("doc2", "102")].into_iter().enumerate() {
        let actions = complete_rev(
            &mut puller,
            &returning,
            rev_msg(10 + number as u64, doc, "1-x", seq),
            None,
        );
        finished += actions
            .iter()
            .filter(|action| matches!(action, PullerAction::FinishedDocument(_)))
            .count();
    }
    assert_eq!(finished, 2);
    assert_eq!(puller.counters().unfinished_incoming_revs, 0);
    assert_eq!(puller.counters().active_incoming_revs, 0);
}
