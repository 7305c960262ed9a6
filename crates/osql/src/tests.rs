//! End-to-end session tests against the simulated master.
//!
//! These drive whole transactions through [`Harness`] and check what each
//! simulated master host received.

#![allow(clippy::cast_possible_truncation)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use proptest::prelude::*;
use test_case::test_case;

use crate::message::{BlobPayload, KeyMask, MessageKind, OsqlMessage, ReadKind, SchemaChange};
use crate::shadow::{ShadowBuffer, ShadowError};
use crate::testing::{DenyWrites, Harness, ScriptedCoordinator, StuckCheckboard};
use crate::{
    ClientOptions, ErrorRecord, Genid, HostName, IndexKeys, MasterErrorCode, OsqlConfig,
    OsqlError, Outcome, RequestType, RowChange, Session, TableDescriptor, TableName,
    TableTarget, TransactionMode,
};

// ============================================================================
// Helper Functions
// ============================================================================

fn m1() -> HostName {
    HostName::new("m1")
}

fn m2() -> HostName {
    HostName::new("m2")
}

fn table(name: &str) -> TableDescriptor {
    TableDescriptor::plain(name, 1)
}

fn row(n: u64) -> RowChange {
    RowChange::new(Genid::new(n), Bytes::from(n.to_be_bytes().to_vec()))
}

fn kinds(messages: &[OsqlMessage]) -> Vec<MessageKind> {
    messages.iter().map(OsqlMessage::kind).collect()
}

fn insert_genids(messages: &[OsqlMessage]) -> Vec<u64> {
    messages
        .iter()
        .filter_map(|m| match m {
            OsqlMessage::Insert { genid, .. } => Some(genid.as_u64()),
            _ => None,
        })
        .collect()
}

fn usedb_tables(messages: &[OsqlMessage]) -> Vec<String> {
    messages
        .iter()
        .filter_map(|m| match m {
            OsqlMessage::UseDb { table, .. } => Some(table.as_str().to_string()),
            _ => None,
        })
        .collect()
}

/// Session whose checkboard refuses every unregister.
fn stuck_session(h: &Harness, options: ClientOptions) -> (Session, Arc<StuckCheckboard>) {
    let stuck = Arc::new(StuckCheckboard::new(Arc::clone(&h.checkboard)));
    let mut env = h.env.clone();
    env.checkboard = Arc::clone(&stuck) as Arc<dyn crate::Checkboard>;
    (Session::new(env, options), stuck)
}

fn config_with(f: impl FnOnce(&mut OsqlConfig)) -> OsqlConfig {
    let mut config = OsqlConfig::testing();
    f(&mut config);
    config
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

#[test]
fn three_inserts_then_commit() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());
    let t1 = table("t1");

    for n in 1..=3 {
        session.insert(&t1, &row(n)).expect("insert");
    }
    session.commit().expect("commit");

    let received = h.master.messages_to(&m1());
    assert_eq!(
        kinds(&received),
        vec![
            MessageKind::StartSession,
            MessageKind::UseDb,
            MessageKind::Insert,
            MessageKind::Insert,
            MessageKind::Insert,
            MessageKind::Commit,
        ]
    );
    assert!(matches!(
        received.last(),
        Some(OsqlMessage::Commit { op_count: 3, .. })
    ));
    assert!(!session.is_registered());
    assert!(h.checkboard.is_empty());
    assert!(session.shadow().is_closed());
    assert_eq!(session.outcome(), Some(Outcome::Committed));
}

#[test]
fn wrong_master_on_second_insert_restarts_and_replays() {
    let h = Harness::testing();
    h.master.fail_send(MessageKind::Insert, 2, Some(m2()));
    let mut session = h.session(ClientOptions::default());
    let t1 = table("t1");

    session.insert(&t1, &row(1)).expect("insert 1");
    let first_key = session.key().expect("registered");
    session.insert(&t1, &row(2)).expect("insert 2");
    let second_key = session.key().expect("registered");
    session.insert(&t1, &row(3)).expect("insert 3");
    session.commit().expect("commit");

    assert_ne!(first_key, second_key);

    let old = h.master.messages_to(&m1());
    assert_eq!(
        kinds(&old),
        vec![
            MessageKind::StartSession,
            MessageKind::UseDb,
            MessageKind::Insert
        ]
    );

    let new = h.master.messages_to(&m2());
    assert_eq!(
        kinds(&new),
        vec![
            MessageKind::StartSession,
            MessageKind::UseDb,
            MessageKind::Insert,
            MessageKind::Insert,
            MessageKind::Insert,
            MessageKind::Commit,
        ]
    );
    assert_eq!(insert_genids(&new), vec![1, 2, 3]);
    assert!(matches!(
        new.last(),
        Some(OsqlMessage::Commit { op_count: 3, .. })
    ));
    assert!(h.checkboard.is_empty());
}

#[test]
fn capacity_rejects_third_insert_without_sending() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default().with_max_transaction_ops(2));
    let t1 = table("t1");

    session.insert(&t1, &row(1)).expect("insert 1");
    session.insert(&t1, &row(2)).expect("insert 2");
    let err = session.insert(&t1, &row(3)).expect_err("insert 3");

    assert_eq!(err, OsqlError::TooBig);
    assert_eq!(err.code(), 18);
    assert_eq!(h.master.attempts(MessageKind::Insert), 2);
    assert_eq!(session.error().master_code(), MasterErrorCode::TOO_BIG);

    session.abort().expect("abort");
    let received = h.master.messages_to(&m1());
    match received.last() {
        Some(OsqlMessage::Commit {
            error, op_count, ..
        }) => {
            assert_eq!(*op_count, 0);
            assert_eq!(error.master_code(), MasterErrorCode::TOO_BIG);
            assert!(error.message.ends_with("rollback"));
        }
        other => panic!("expected rollback, got {other:?}"),
    }
    assert_eq!(session.outcome(), Some(Outcome::Aborted));
    assert!(h.checkboard.is_empty());
    assert_eq!(session.state().counters.transaction_op_count, 0);
}

#[test_case(MasterErrorCode::NO_MASTER, OsqlError::Abort; "no master")]
#[test_case(MasterErrorCode::NOT_DURABLE, OsqlError::ChangeNode; "not durable")]
fn commit_survives_exactly_six_hundred_swings(code: MasterErrorCode, expected: OsqlError) {
    let h = Harness::testing();
    h.master
        .repeat_commit_outcome(&ErrorRecord::new(code, "master went away"), 601);
    let mut session = h.session(ClientOptions::default());

    session.insert(&table("t1"), &row(1)).expect("insert");
    let err = session.commit().expect_err("commit");

    assert_eq!(err, expected);
    assert_eq!(h.master.count(MessageKind::Commit), 601);
    // One start for the session, one per restart.
    assert_eq!(h.master.count(MessageKind::StartSession), 601);
    assert!(h.checkboard.is_empty());
    assert_eq!(session.outcome(), Some(Outcome::CommitFailed));
}

// ============================================================================
// Commit outcome mapping
// ============================================================================

#[test_case(MasterErrorCode::TOO_BIG => OsqlError::TooBig; "too big")]
#[test_case(MasterErrorCode::NO_MASTER => OsqlError::Abort; "no master")]
#[test_case(MasterErrorCode::NOT_DURABLE => OsqlError::ChangeNode; "not durable")]
#[test_case(MasterErrorCode::MASTER_TIMEOUT => OsqlError::MasterTimeout; "master timeout")]
#[test_case(MasterErrorCode::VERIFY_FAILED => OsqlError::Abort; "verify failed")]
#[test_case(MasterErrorCode::LEGACY_SWING => OsqlError::Abort; "legacy swing")]
fn commit_maps_master_errors(code: MasterErrorCode) -> OsqlError {
    let h = Harness::new(config_with(|c| c.failover.survive_master_swings = 0));
    h.master.push_commit_outcome(ErrorRecord::new(code, "rejected"));
    let mut session = h.session(ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");

    let err = session.commit().expect_err("commit");

    assert!(!session.is_registered());
    assert!(h.checkboard.is_empty());
    assert_eq!(session.error().master_code(), code);
    err
}

#[test]
fn commit_retries_once_after_swing_and_keeps_identifier() {
    let h = Harness::testing();
    h.master
        .push_commit_outcome(ErrorRecord::new(MasterErrorCode::NO_MASTER, "no master"));
    let mut session = h.session(ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");
    let key = session.key().expect("registered");

    session.commit().expect("commit");

    let commits: Vec<_> = h
        .master
        .delivered()
        .into_iter()
        .filter(|d| d.message.kind() == MessageKind::Commit)
        .collect();
    assert_eq!(commits.len(), 2);
    assert!(commits.iter().all(|d| d.key == key));
    // Replay re-sent the insert before the retried commit.
    assert_eq!(h.master.count(MessageKind::Insert), 2);
    assert_eq!(session.outcome(), Some(Outcome::Committed));
}

#[test]
fn commit_without_outcome_times_out_as_change_node() {
    let h = Harness::new(config_with(|c| c.commit.max_commit_wait_secs = 1));
    h.master.withhold_outcomes(true);
    let mut session = h.session(ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");

    assert_eq!(session.commit(), Err(OsqlError::ChangeNode));
    assert!(h.checkboard.is_empty());
}

#[test]
fn commit_fails_when_cursor_locks_cannot_be_released() {
    let h = Harness::testing();
    h.engine.fail_release(true);
    let mut session = h.session(ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");

    assert!(matches!(session.commit(), Err(OsqlError::Internal(_))));
    assert_eq!(h.master.count(MessageKind::Commit), 0);
    assert!(h.checkboard.is_empty());
    assert!(h.engine.shadow_aborts() >= 1);
}

#[test]
fn schema_change_commit_hands_off_to_new_master() {
    let h = Harness::testing();
    h.master
        .push_commit_outcome(ErrorRecord::new(MasterErrorCode::NO_MASTER, "no master"));
    let mut options = ClientOptions::default();
    options.in_client_transaction = false;
    let mut session = h.session(options);

    session
        .schema_change(
            SchemaChange::new("t2", Bytes::from_static(b"alter")),
            Some(TableTarget::new("t2", 1)),
        )
        .expect("schema change");
    let err = session.commit().expect_err("commit");

    assert_eq!(err, OsqlError::Abort);
    assert_eq!(session.error().master_code(), MasterErrorCode::SCHEMA_CHANGE);
    assert!(session
        .error()
        .message
        .contains("new master will resume schemachange"));
    assert_eq!(h.master.count(MessageKind::StartSession), 1);
}

#[test]
fn verify_failure_with_select_for_update_is_not_retriable() {
    let h = Harness::new(config_with(|c| c.failover.survive_master_swings = 0));
    h.master
        .push_commit_outcome(ErrorRecord::new(MasterErrorCode::VERIFY_FAILED, "verify"));
    let mut session = h.session(ClientOptions::default());
    session
        .record_read(ReadKind::SelectForUpdate, TableName::new("t1"), Genid::new(7))
        .expect("record read");
    session.insert(&table("t1"), &row(1)).expect("insert");

    assert_eq!(session.commit(), Err(OsqlError::Abort));
    assert!(session.is_non_retriable());

    let received = h.master.messages_to(&m1());
    let tail = kinds(&received[received.len() - 2..]);
    assert_eq!(tail, vec![MessageKind::ReadSet, MessageKind::Commit]);
}

#[test]
fn verify_failure_without_read_set_stays_retriable() {
    let h = Harness::testing();
    h.master
        .push_commit_outcome(ErrorRecord::new(MasterErrorCode::VERIFY_FAILED, "verify"));
    let mut session = h.session(ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");

    assert_eq!(session.commit(), Err(OsqlError::Abort));
    assert!(!session.is_non_retriable());
}

#[test]
fn distributed_failure_aborts_without_retry() {
    let h = Harness::testing();
    let coordinator = ScriptedCoordinator {
        fail: true,
        ..Default::default()
    };
    let commits = Arc::clone(&coordinator.commits);
    let mut session =
        Session::new(h.env.clone(), ClientOptions::default()).with_distributed(Box::new(coordinator));
    session.insert(&table("t1"), &row(1)).expect("insert");

    assert_eq!(session.commit(), Err(OsqlError::Abort));
    assert_eq!(commits.load(std::sync::atomic::Ordering::Relaxed), 1);
    assert_eq!(session.outcome(), Some(Outcome::Aborted));
    assert!(h.checkboard.is_empty());
    match h.master.messages_to(&m1()).last() {
        Some(OsqlMessage::Commit { error, .. }) => {
            assert_eq!(error.master_code(), MasterErrorCode::ABORTED);
        }
        other => panic!("expected rollback, got {other:?}"),
    }
}

#[test]
fn distributed_commit_skips_swing_retries() {
    let h = Harness::testing();
    h.master
        .push_commit_outcome(ErrorRecord::new(MasterErrorCode::NO_MASTER, "no master"));
    let mut session = Session::new(h.env.clone(), ClientOptions::default())
        .with_distributed(Box::new(ScriptedCoordinator::default()));
    session.insert(&table("t1"), &row(1)).expect("insert");

    assert_eq!(session.commit(), Err(OsqlError::Abort));
    assert_eq!(h.master.count(MessageKind::StartSession), 1);
}

#[test]
fn commit_carries_continuation_token() {
    let h = Harness::testing();
    let mut options = ClientOptions::default().with_cnonce(Bytes::from_static(b"cnonce-1"));
    options.high_availability = true;
    options.replicant_can_retry = true;
    let mut session = h.session(options);
    session.insert(&table("t1"), &row(1)).expect("insert");
    let key = session.key().expect("registered");

    session.commit().expect("commit");

    match h.master.messages_to(&m1()).last() {
        Some(OsqlMessage::Commit {
            snapshot: Some(snapshot),
            ..
        }) => {
            assert_eq!(snapshot.cnonce, Bytes::from_static(b"cnonce-1"));
            assert_eq!(Some(snapshot.uuid), key.uuid());
            assert!(snapshot.replicant_can_retry);
            assert_eq!(snapshot.effects.inserted, 1);
        }
        other => panic!("expected commit with snapshot, got {other:?}"),
    }
}

#[test]
fn stored_procedures_do_not_send_continuation_token() {
    let h = Harness::testing();
    let mut options = ClientOptions::default().with_cnonce(Bytes::from_static(b"c"));
    options.high_availability = true;
    options.has_stored_procedure = true;
    let mut session = h.session(options);
    session.insert(&table("t1"), &row(1)).expect("insert");
    session.commit().expect("commit");

    assert!(matches!(
        h.master.messages_to(&m1()).last(),
        Some(OsqlMessage::Commit { snapshot: None, .. })
    ));
}

// ============================================================================
// Abort and teardown
// ============================================================================

#[test]
fn abort_before_start_is_local_only() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());

    session.abort().expect("abort");

    assert!(h.master.delivered().is_empty());
    assert_eq!(session.outcome(), Some(Outcome::Aborted));
    assert_eq!(h.engine.shadow_aborts(), 1);
}

#[test]
fn abort_after_commit_keeps_outcome() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");
    session.commit().expect("commit");

    session.abort().expect("abort");
    assert_eq!(session.outcome(), Some(Outcome::Committed));
    assert_eq!(h.master.count(MessageKind::Commit), 1);
}

#[test]
fn finished_session_rejects_operations() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");
    session.commit().expect("commit");

    assert!(matches!(
        session.insert(&table("t1"), &row(2)),
        Err(OsqlError::Internal(_))
    ));
    assert!(matches!(session.commit(), Err(OsqlError::Internal(_))));
}

#[test]
fn dropping_a_registered_session_unregisters_it() {
    let h = Harness::testing();
    {
        let mut session = h.session(ClientOptions::default());
        session.insert(&table("t1"), &row(1)).expect("insert");
        assert_eq!(h.checkboard.len(), 1);
    }
    assert!(h.checkboard.is_empty());
}

#[test]
fn schema_change_during_commit_replay_maps_to_abort() {
    let h = Harness::testing();
    h.master
        .push_commit_outcome(ErrorRecord::new(MasterErrorCode::NO_MASTER, "no master"));
    let mut session = h.session(ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");
    session
        .shadow_mut()
        .fail_next_replay(ShadowError::SchemaChange("t1 altered".into()));

    let err = session.commit().expect_err("commit");

    assert_eq!(err, OsqlError::Abort);
    assert_eq!(err.code(), 4);
    assert_eq!(session.error().master_code(), MasterErrorCode::SCHEMA_CHANGE);
    assert_eq!(h.master.count(MessageKind::Commit), 1);
    assert!(h.checkboard.is_empty());
    assert_eq!(session.outcome(), Some(Outcome::CommitFailed));
}

// ============================================================================
// Unregister failures
// ============================================================================

#[test]
fn failed_unregister_downgrades_committed_transaction() {
    let h = Harness::testing();
    let (mut session, stuck) = stuck_session(&h, ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");

    let err = session.commit().expect_err("commit");

    assert!(matches!(err, OsqlError::Internal(_)));
    assert_eq!(stuck.refused(), 1);
    assert!(!session.is_registered());
    assert!(session.shadow().is_closed());
    assert_eq!(session.outcome(), Some(Outcome::CommitFailed));
}

#[test]
fn failed_unregister_keeps_worse_commit_error() {
    let h = Harness::new(config_with(|c| c.failover.survive_master_swings = 0));
    h.master
        .push_commit_outcome(ErrorRecord::new(MasterErrorCode::NO_MASTER, "no master"));
    let (mut session, stuck) = stuck_session(&h, ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");

    assert_eq!(session.commit(), Err(OsqlError::Abort));
    assert_eq!(stuck.refused(), 1);
    assert_eq!(session.outcome(), Some(Outcome::CommitFailed));
}

#[test]
fn failed_unregister_on_abort_still_cleans_up() {
    let h = Harness::testing();
    let (mut session, stuck) = stuck_session(&h, ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");

    let err = session.abort().expect_err("abort");

    assert!(matches!(err, OsqlError::Internal(_)));
    assert_eq!(stuck.refused(), 1);
    // The rollback still reached the master.
    assert!(matches!(
        h.master.messages_to(&m1()).last(),
        Some(OsqlMessage::Commit { op_count: 0, .. })
    ));
    assert!(!session.is_registered());
    assert!(session.shadow().is_closed());
    assert_eq!(h.engine.shadow_aborts(), 1);
    assert_eq!(session.state().counters.sent_op_count, 0);
    assert_eq!(session.outcome(), Some(Outcome::Aborted));
}

// ============================================================================
// Start and restart
// ============================================================================

#[test]
fn no_master_fails_start_with_abort() {
    let h = Harness::new(config_with(|c| {
        c.failover.master_discovery_retries = 3;
        c.failover.master_discovery_poll_ms = 500;
    }));
    h.cluster.set_master(None);
    let mut session = h.session(ClientOptions::default());

    let err = session.insert(&table("t1"), &row(1)).expect_err("insert");

    assert_eq!(err, OsqlError::Abort);
    assert_eq!(session.error().master_code(), MasterErrorCode::NO_MASTER);
    assert_eq!(session.error().message, "No master available");
    assert_eq!(h.clock.sleeps(), vec![Duration::from_millis(500); 3]);
    assert!(h.checkboard.is_empty());
}

#[test]
fn deadlock_recovery_escalates_then_gives_up() {
    let h = Harness::new(config_with(|c| {
        c.failover.master_discovery_retries = 500;
        c.failover.deadlock_backoff_step_ms = 100;
        c.failover.deadlock_backoff_cap_ms = 1000;
    }));
    // Every discovery round checks for lock contention first.
    h.cluster.set_master(None);
    h.engine.contend(200);
    let mut session = h.session(ClientOptions::default());

    let err = session.insert(&table("t1"), &row(1)).expect_err("insert");

    assert!(matches!(err, OsqlError::Busy(_)));
    assert_eq!(err.code(), 5);
    let recoveries = h.engine.recoveries();
    // The recovery that pushes the count past the limit still runs.
    assert_eq!(recoveries.len(), 101);
    assert_eq!(recoveries[0], Duration::ZERO);
    assert_eq!(recoveries[1], Duration::from_millis(100));
    assert_eq!(recoveries[10], Duration::from_millis(1000));
    assert_eq!(recoveries[100], Duration::from_millis(1000));
    assert_eq!(session.state().deadlock_recovered, 101);
    assert!(h.checkboard.is_empty());
}

#[test]
fn first_deadlock_recovery_does_not_wait() {
    let h = Harness::new(config_with(|c| c.failover.deadlock_backoff_step_ms = 100));
    h.engine.contend(1);
    let mut session = h.session(ClientOptions::default());

    session.insert(&table("t1"), &row(1)).expect("insert");
    assert_eq!(h.engine.recoveries(), vec![Duration::ZERO]);
    assert_eq!(session.state().deadlock_recovered, 1);
}

#[test]
fn start_requests_self_lock_check_after_many_verify_retries() {
    let h = Harness::testing();
    let mut options = ClientOptions::default();
    options.verify_retries = 1001;
    let mut session = h.session(options);

    session.start(RequestType::Sock, false).expect("start");
    assert!(matches!(
        h.master.messages_to(&m1()).first(),
        Some(OsqlMessage::StartSession {
            check_self_lock: true,
            ..
        })
    ));
}

#[test]
fn restart_gives_up_after_max_retries() {
    let h = Harness::new(config_with(|c| c.failover.master_discovery_retries = 2));
    h.master.set_always_wrong_master(true);
    let mut session = h.session(ClientOptions::default());

    let err = session.restart(5, false).expect_err("restart");

    assert_eq!(err, OsqlError::RestartFailed { attempts: 5 });
    assert_eq!(err.code(), -1);
    // Each attempt tries the start request three times.
    assert_eq!(h.master.attempts(MessageKind::StartSession), 15);
    assert_eq!(
        h.clock.sleeps(),
        vec![
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_secs(4)
        ]
    );
    assert!(h.checkboard.is_empty());
}

#[test]
fn exhausted_restart_surfaces_as_internal_error() {
    let h = Harness::new(config_with(|c| {
        c.failover.survive_master_swings = 3;
        c.failover.master_discovery_retries = 1;
    }));
    let mut session = h.session(ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");
    h.master.set_always_wrong_master(true);

    let err = session.insert(&table("t1"), &row(2)).expect_err("insert");
    assert!(matches!(err, OsqlError::Internal(_)));
}

#[test]
fn replay_schema_change_error_is_fatal() {
    let h = Harness::testing();
    h.master.fail_send(MessageKind::Insert, 2, Some(m2()));
    let mut session = h.session(ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");
    session
        .shadow_mut()
        .fail_next_replay(ShadowError::SchemaChange("t1 altered".into()));

    let err = session.insert(&table("t1"), &row(2)).expect_err("insert");
    assert!(matches!(err, OsqlError::SchemaChange(_)));
    assert_eq!(err.code(), 240);
}

#[test]
fn recom_ships_buffer_at_commit() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::new(TransactionMode::Recom));
    let t1 = table("t1");

    session.insert(&t1, &row(1)).expect("insert");
    session.insert(&t1, &row(2)).expect("insert");
    assert!(h.master.delivered().is_empty());
    assert_eq!(session.shadow().len(), 2);

    session.commit().expect("commit");
    let received = h.master.messages_to(&m1());
    assert_eq!(
        kinds(&received),
        vec![
            MessageKind::StartSession,
            MessageKind::UseDb,
            MessageKind::Insert,
            MessageKind::Insert,
            MessageKind::Commit,
        ]
    );
    assert!(matches!(
        received.first(),
        Some(OsqlMessage::StartSession {
            request_type: RequestType::Recom,
            ..
        })
    ));
    assert!(matches!(
        received.last(),
        Some(OsqlMessage::Commit { op_count: 2, .. })
    ));
}

#[test]
fn serial_commit_ships_read_set() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::new(TransactionMode::Serial));
    session
        .record_read(ReadKind::Serial, TableName::new("t1"), Genid::new(11))
        .expect("record read");
    session.insert(&table("t1"), &row(1)).expect("insert");

    session.commit().expect("commit");
    let received = h.master.messages_to(&m1());
    assert_eq!(
        kinds(&received),
        vec![
            MessageKind::StartSession,
            MessageKind::UseDb,
            MessageKind::Insert,
            MessageKind::ReadSet,
            MessageKind::Commit,
        ]
    );
    match &received[3] {
        OsqlMessage::ReadSet { kind, entries } => {
            assert_eq!(*kind, ReadKind::Serial);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].genid, Genid::new(11));
        }
        other => panic!("expected read set, got {other:?}"),
    }
}

// ============================================================================
// Per-operation shape
// ============================================================================

#[test]
fn usedb_sent_once_per_table_run() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());

    session.insert(&table("t1"), &row(1)).expect("insert");
    session.insert(&table("t1"), &row(2)).expect("insert");
    session.insert(&table("t2"), &row(3)).expect("insert");
    session.insert(&table("t1"), &row(4)).expect("insert");

    assert_eq!(
        usedb_tables(&h.master.messages_to(&m1())),
        vec!["t1", "t2", "t1"]
    );
}

#[test]
fn restart_forces_one_new_usedb() {
    let h = Harness::testing();
    h.master.fail_send(MessageKind::Insert, 3, Some(m2()));
    let mut session = h.session(ClientOptions::default());
    for n in 1..=3 {
        session.insert(&table("t1"), &row(n)).expect("insert");
    }

    let new = h.master.messages_to(&m2());
    assert_eq!(usedb_tables(&new), vec!["t1"]);
    assert_eq!(insert_genids(&new), vec![1, 2, 3]);
}

#[test]
fn index_send_restarts_from_first_index() {
    let h = Harness::testing();
    h.master.fail_send(MessageKind::Index, 2, Some(m2()));
    let mut session = h.session(ClientOptions::default());
    let t1 = TableDescriptor {
        index_count: 3,
        has_expression_indexes: true,
        ..table("t1")
    };
    let keys = IndexKeys::new(
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ],
        KeyMask::ALL,
    );

    session
        .insert(&t1, &row(1).with_index_keys(keys, IndexKeys::default()))
        .expect("insert");

    let new = h.master.messages_to(&m2());
    assert_eq!(
        kinds(&new),
        vec![
            MessageKind::StartSession,
            MessageKind::UseDb,
            MessageKind::Index,
            MessageKind::Index,
            MessageKind::Index,
            MessageKind::Insert,
        ]
    );
    let indexes: Vec<u32> = new
        .iter()
        .filter_map(|m| match m {
            OsqlMessage::Index { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(indexes, vec![0, 1, 2]);
}

#[test_case(true, vec![0, 2], KeyMask::from_bits(0b101); "partial indexes on")]
#[test_case(false, vec![0, 1, 2], KeyMask::ALL; "partial indexes off")]
fn partial_index_filtering(enabled: bool, expected: Vec<u32>, expected_mask: KeyMask) {
    let h = Harness::new(config_with(|c| c.features.partial_indexes = enabled));
    let mut session = h.session(ClientOptions::default());
    let t1 = TableDescriptor {
        index_count: 3,
        has_expression_indexes: true,
        has_partial_indexes: true,
        ..table("t1")
    };
    let keys = IndexKeys::new(
        vec![
            Bytes::from_static(b"a"),
            Bytes::from_static(b"b"),
            Bytes::from_static(b"c"),
        ],
        KeyMask::from_bits(0b101),
    );

    session
        .insert(&t1, &row(1).with_index_keys(keys, IndexKeys::default()))
        .expect("insert");

    let received = h.master.messages_to(&m1());
    let indexes: Vec<u32> = received
        .iter()
        .filter_map(|m| match m {
            OsqlMessage::Index { index, .. } => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(indexes, expected);
    assert!(received.iter().any(|m| matches!(
        m,
        OsqlMessage::Insert { ins_keys, .. } if *ins_keys == expected_mask
    )));
}

#[test]
fn expression_indexes_only_ship_for_tables_that_have_them() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());
    let t1 = TableDescriptor {
        index_count: 1,
        ..table("t1")
    };
    let keys = IndexKeys::new(vec![Bytes::from_static(b"a")], KeyMask::ALL);

    session
        .insert(&t1, &row(1).with_index_keys(keys, IndexKeys::default()))
        .expect("insert");
    assert_eq!(h.master.count(MessageKind::Index), 0);
    assert_eq!(session.state().counters.transaction_op_count, 1);
}

#[test]
fn update_sends_unused_blob_token() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());
    let t1 = TableDescriptor {
        blob_columns: vec![1, 3],
        ..table("t1")
    };
    let change = row(1)
        .with_blobs(vec![
            Some(Bytes::from_static(b"old")),
            Some(Bytes::from_static(b"new")),
            None,
        ])
        .with_updated_columns(vec![0, -1, 2, 3]);

    session.update(&t1, &change).expect("update");

    let received = h.master.messages_to(&m1());
    assert_eq!(
        kinds(&received),
        vec![
            MessageKind::StartSession,
            MessageKind::UseDb,
            MessageKind::Blob,
            MessageKind::Blob,
            MessageKind::UpdateCols,
            MessageKind::Update,
        ]
    );
    let blobs: Vec<(u32, i64)> = received
        .iter()
        .filter_map(|m| match m {
            OsqlMessage::Blob { index, payload, .. } => Some((*index, payload.wire_len())),
            _ => None,
        })
        .collect();
    assert_eq!(blobs, vec![(0, BlobPayload::NOT_USED_LEN), (1, 3)]);
    assert_eq!(session.state().effects.updated, 1);
}

#[test]
fn insert_blobs_always_carry_data() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());
    let t1 = TableDescriptor {
        blob_columns: vec![1],
        ..table("t1")
    };
    let change = row(1).with_blobs(vec![Some(Bytes::new())]);

    session.insert(&t1, &change).expect("insert");
    assert!(h.master.messages_to(&m1()).iter().any(|m| matches!(
        m,
        OsqlMessage::Blob {
            payload: BlobPayload::Data(data),
            ..
        } if data.is_empty()
    )));
}

#[test]
fn delete_sends_record_with_key_mask() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());

    session
        .delete(&table("t1"), Genid::new(4), &IndexKeys::default())
        .expect("delete");
    assert!(matches!(
        h.master.messages_to(&m1()).last(),
        Some(OsqlMessage::Delete { del_keys, .. }) if *del_keys == KeyMask::ALL
    ));
    assert_eq!(session.state().effects.deleted, 1);
}

#[test]
fn access_denied_sends_nothing() {
    let h = Harness::testing();
    let env = h
        .env
        .clone()
        .with_access(Arc::new(DenyWrites::new([TableName::new("secret")])));
    let mut session = Session::new(env, ClientOptions::default().with_user("mallory"));

    let err = session.insert(&table("secret"), &row(1)).expect_err("insert");

    assert!(matches!(err, OsqlError::AccessDenied(_)));
    assert_eq!(err.code(), 4);
    assert_eq!(session.error().master_code(), MasterErrorCode::ACCESS);
    assert!(h.master.delivered().is_empty());
    assert_eq!(session.state().counters.transaction_op_count, 0);
}

#[test]
fn mixing_schema_change_and_data_change_is_rejected() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());
    session.insert(&table("t1"), &row(1)).expect("insert");

    let err = session
        .schema_change(
            SchemaChange::new("t1", Bytes::from_static(b"alter")),
            Some(TableTarget::new("t1", 1)),
        )
        .expect_err("schema change");
    assert_eq!(err, OsqlError::DdlMisuse(TableName::new("t1")));

    session
        .schema_change(
            SchemaChange::new("t2", Bytes::from_static(b"alter")),
            Some(TableTarget::new("t2", 1)),
        )
        .expect("schema change");
    let err = session.insert(&table("t2"), &row(2)).expect_err("insert");
    assert_eq!(err, OsqlError::DdlMisuse(TableName::new("t2")));
}

#[test]
fn schema_change_in_client_transaction_binds_session() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());

    session
        .schema_change(
            SchemaChange::new("t2", Bytes::from_static(b"alter")),
            Some(TableTarget::new("t2", 1)),
        )
        .expect("schema change");
    let key = session.key();
    session.insert(&table("t3"), &row(1)).expect("insert");

    let received = h.master.messages_to(&m1());
    assert!(received.iter().any(|m| matches!(
        m,
        OsqlMessage::SchemaChange(change) if change.bound_session == key
    )));
    assert_eq!(usedb_tables(&received), vec!["t2", "t3"]);
    assert!(session.state().running_ddl);
}

#[test]
fn schema_change_outside_client_transaction_is_unbound() {
    let h = Harness::testing();
    let mut options = ClientOptions::default();
    options.in_client_transaction = false;
    let mut session = h.session(options);

    session
        .schema_change(SchemaChange::new("v1", Bytes::from_static(b"alter")), None)
        .expect("schema change");

    let received = h.master.messages_to(&m1());
    assert_eq!(
        kinds(&received),
        vec![MessageKind::StartSession, MessageKind::SchemaChange]
    );
    assert!(matches!(
        &received[1],
        OsqlMessage::SchemaChange(change) if change.bound_session.is_none()
    ));
}

#[test]
fn queue_consume_targets_queue_table() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());

    session
        .dbqueue_consume("audit", Genid::new(5))
        .expect("consume");

    let received = h.master.messages_to(&m1());
    assert_eq!(usedb_tables(&received), vec!["__qaudit"]);
    assert_eq!(received.last().map(OsqlMessage::kind), Some(MessageKind::DbqConsume));
    assert_eq!(session.shadow().len(), 1);
}

#[test]
fn queue_consume_is_not_duplicated_by_restart() {
    let h = Harness::testing();
    h.master.fail_send(MessageKind::DbqConsume, 1, Some(m2()));
    let mut session = h.session(ClientOptions::default());

    session
        .dbqueue_consume("audit", Genid::new(5))
        .expect("consume");
    assert_eq!(h.master.count_to(&m2(), MessageKind::DbqConsume), 1);
}

#[test]
fn synthetic_genids_are_not_recorded() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());

    session
        .record_genid(&table("t1"), Genid::new((1 << 63) | 5))
        .expect("record");
    assert!(h.master.delivered().is_empty());

    session
        .record_genid(&table("t1"), Genid::new(5))
        .expect("record");
    assert_eq!(h.master.count(MessageKind::RecordGenid), 1);
}

#[test]
fn debug_log_cookie_is_stable_per_session() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());

    session.query_debug_log(1).expect("debug log");
    session.query_debug_log(2).expect("debug log");

    let cookies: Vec<u64> = h
        .master
        .messages_to(&m1())
        .iter()
        .filter_map(|m| match m {
            OsqlMessage::DebugLog { cookie, .. } => Some(*cookie),
            _ => None,
        })
        .collect();
    assert_eq!(cookies.len(), 2);
    assert_eq!(cookies[0], cookies[1]);
}

#[test]
fn stat_and_stored_function_messages_are_forwarded() {
    let h = Harness::testing();
    let mut session = h.session(ClientOptions::default());

    session
        .update_stat1(Genid::new(1), Bytes::from_static(b"stat"), 0)
        .expect("stat");
    session
        .bpfunc(crate::BpfuncCall {
            name: "grant".to_string(),
            args: Bytes::from_static(b"x"),
        })
        .expect("bpfunc");

    assert_eq!(
        kinds(&h.master.messages_to(&m1())),
        vec![
            MessageKind::StartSession,
            MessageKind::UpdateStat,
            MessageKind::Bpfunc
        ]
    );
    assert_eq!(session.shadow().len(), 2);
}

// ============================================================================
// Admission
// ============================================================================

#[test]
fn process_default_limit_applies_without_override() {
    let h = Harness::testing();
    h.env.tunables.set_max_transfer(1);
    let mut session = h.session(ClientOptions::default());

    session.insert(&table("t1"), &row(1)).expect("insert");
    assert_eq!(
        session.insert(&table("t1"), &row(2)),
        Err(OsqlError::TooBig)
    );

    let mut unlimited = h.session(ClientOptions::default().with_max_transaction_ops(0));
    for n in 1..=5 {
        unlimited.insert(&table("t1"), &row(n)).expect("insert");
    }
    assert_eq!(unlimited.max_transaction_ops(), 0);
}

#[test]
fn restart_does_not_reset_transaction_count() {
    let h = Harness::testing();
    h.master.fail_send(MessageKind::Insert, 2, Some(m2()));
    let mut session = h.session(ClientOptions::default().with_max_transaction_ops(3));

    for n in 1..=3 {
        session.insert(&table("t1"), &row(n)).expect("insert");
    }
    assert_eq!(session.state().counters.transaction_op_count, 3);
    assert_eq!(session.state().counters.sent_op_count, 3);
    assert_eq!(
        session.insert(&table("t1"), &row(4)),
        Err(OsqlError::TooBig)
    );

    session.abort().expect("abort");
    assert_eq!(session.state().counters.transaction_op_count, 0);
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #[test]
    fn prop_swing_replays_in_original_order(n in 1u64..8, k_seed in 0u64..8) {
        let k = k_seed % n + 1;
        let h = Harness::testing();
        h.master.fail_send(MessageKind::Insert, k as usize, Some(m2()));
        let mut session = h.session(ClientOptions::default());

        for i in 1..=n {
            prop_assert!(session.insert(&table("t1"), &row(i)).is_ok());
        }

        let expected: Vec<u64> = (1..=n).collect();
        prop_assert_eq!(insert_genids(&h.master.messages_to(&m2())), expected);
        let before: Vec<u64> = (1..k).collect();
        prop_assert_eq!(insert_genids(&h.master.messages_to(&m1())), before);
    }

    #[test]
    fn prop_limit_admits_exactly_m(limit in 1u64..20) {
        let h = Harness::testing();
        let mut session = h.session(ClientOptions::default().with_max_transaction_ops(limit));

        for i in 1..=limit {
            prop_assert!(session.insert(&table("t1"), &row(i)).is_ok());
        }
        prop_assert_eq!(
            session.insert(&table("t1"), &row(limit + 1)),
            Err(OsqlError::TooBig)
        );
        prop_assert_eq!(h.master.count(MessageKind::Insert) as u64, limit);
    }
}
