//! Crash-and-resume coverage for the file-backed completion journal.
//!
//! Each test interrupts a running session (dropping or aborting its
//! worker mid-flight), resumes a fresh machine from the journal file,
//! and verifies that the resumed run continues the original billing
//! stream: same session id, continued sequence numbers, no charge posted
//! twice, no category counted twice.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use glide_core::config::GlideConfig;
use glide_core::gateway::SimulatedGateway;
use glide_core::ledger::ChargeCategory;
use glide_core::session::{FileJournal, Phase, RentalRequest, SessionMachine, Signal};
use tokio::sync::mpsc;
use tokio::time::sleep;

const RIDER: &str = "rider@example.com";

fn request() -> RentalRequest {
    RentalRequest {
        device_id: "1234".to_string(),
        email: RIDER.to_string(),
        pricing: None,
    }
}

fn sim_gateway() -> Arc<SimulatedGateway> {
    Arc::new(SimulatedGateway::new().with_customer(RIDER, "cus_1"))
}

/// A session interrupted mid-ride resumes from its journal and finishes
/// without double-billing any charge.
#[tokio::test(start_paused = true)]
async fn test_resume_continues_billing_stream() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ride.journal");
    let gateway = sim_gateway();
    let config = GlideConfig::default();

    // First run: unlock, two distance charges, two meter charges, then
    // the worker is dropped mid-session.
    let (tx, rx) = mpsc::unbounded_channel();
    let (machine, reader) = SessionMachine::start(
        request(),
        &config,
        gateway.clone(),
        Box::new(FileJournal::open(&path).expect("journal")),
        rx,
    );
    let session_id = reader.snapshot().session_id.clone();
    let started_at = reader.snapshot().started_at;

    tx.send(Signal::Distance).expect("send");
    tx.send(Signal::Distance).expect("send");
    tokio::select! {
        _ = machine.run() => panic!("session should still be running"),
        () = sleep(Duration::from_secs(31)) => {},
    }

    // Second run: resume from the journal and ride one more meter
    // interval before ending.
    let (tx, rx) = mpsc::unbounded_channel();
    let (machine, reader) = SessionMachine::resume(
        &config,
        gateway.clone(),
        Box::new(FileJournal::open(&path).expect("journal")),
        rx,
    )
    .expect("resumable journal");

    let recovered = reader.snapshot();
    assert_eq!(recovered.session_id, session_id);
    assert_eq!(recovered.phase, Phase::Active);
    assert_eq!(recovered.tokens.total, 24);
    assert_eq!(recovered.distance_ft, 200);

    let handle = tokio::spawn(machine.run());
    sleep(Duration::from_secs(16)).await;
    tx.send(Signal::End).expect("send");
    let receipt = handle.await.expect("join").expect("run");

    assert_eq!(receipt.session_id, session_id);
    assert_eq!(receipt.started_at, started_at);
    assert_eq!(receipt.phase, Phase::Ended);
    assert_eq!(receipt.tokens.unlock, 10);
    assert_eq!(receipt.tokens.time, 6);
    assert_eq!(receipt.tokens.distance, 10);
    assert_eq!(receipt.tokens.total, 26);
    assert!(receipt.tokens.is_balanced());
    assert_eq!(receipt.distance_ft, 200);

    // The gateway saw each charge exactly once, under a distinct key.
    let events = gateway.events().await;
    assert_eq!(events.len(), 6);
    let posted: u64 = events.iter().map(|event| event.tokens).sum();
    assert_eq!(posted, receipt.tokens.total);
    let keys: HashSet<&str> = events
        .iter()
        .map(|event| event.idempotency_key.as_str())
        .collect();
    assert_eq!(keys.len(), events.len());
    assert_eq!(gateway.closed_sessions().await.len(), 1);
}

/// Resuming a journal that already ends in a terminal phase republishes
/// the terminal snapshot without touching the gateway again.
#[tokio::test(start_paused = true)]
async fn test_closed_journal_does_not_reinvoke() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ride.journal");
    let gateway = sim_gateway();
    let config = GlideConfig::default();

    let (tx, rx) = mpsc::unbounded_channel();
    let (machine, _reader) = SessionMachine::start(
        request(),
        &config,
        gateway.clone(),
        Box::new(FileJournal::open(&path).expect("journal")),
        rx,
    );
    tx.send(Signal::End).expect("send");
    let first = machine.run().await.expect("run");
    assert_eq!(first.phase, Phase::Ended);
    assert_eq!(gateway.events().await.len(), 1);
    assert_eq!(gateway.closed_sessions().await.len(), 1);

    let (_tx, rx) = mpsc::unbounded_channel();
    let (machine, reader) = SessionMachine::resume(
        &config,
        gateway.clone(),
        Box::new(FileJournal::open(&path).expect("journal")),
        rx,
    )
    .expect("resumable journal");
    assert_eq!(reader.snapshot().phase, Phase::Ended);

    let replayed = machine.run().await.expect("run");
    assert_eq!(replayed.phase, Phase::Ended);
    assert_eq!(replayed.tokens.total, first.tokens.total);
    assert_eq!(replayed.ended_at, first.ended_at);

    // No new gateway traffic
    assert_eq!(gateway.events().await.len(), 1);
    assert_eq!(gateway.closed_sessions().await.len(), 1);
}

/// A gate approval survives the crash: the resumed session crosses the
/// threshold again without blocking.
#[tokio::test(start_paused = true)]
async fn test_gate_approval_survives_resume() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ride.journal");
    let gateway = sim_gateway();
    let mut config = GlideConfig::default();
    config.session.approval_threshold = 12;

    // First run: block at the 12-token threshold, approve, then abort
    // the worker right after it resumes.
    let (tx, rx) = mpsc::unbounded_channel();
    let (machine, reader) = SessionMachine::start(
        request(),
        &config,
        gateway.clone(),
        Box::new(FileJournal::open(&path).expect("journal")),
        rx,
    );
    let handle = tokio::spawn(machine.run());
    sleep(Duration::from_secs(16)).await;
    assert_eq!(reader.snapshot().phase, Phase::Blocked);
    tx.send(Signal::Approve).expect("send");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(reader.snapshot().phase, Phase::Active);
    handle.abort();
    sleep(Duration::from_millis(1)).await;

    // Second run: the recovered gate stays latched past the threshold.
    let (tx, rx) = mpsc::unbounded_channel();
    let (machine, reader) = SessionMachine::resume(
        &config,
        gateway.clone(),
        Box::new(FileJournal::open(&path).expect("journal")),
        rx,
    )
    .expect("resumable journal");
    assert_eq!(reader.snapshot().tokens.total, 12);

    let handle = tokio::spawn(machine.run());
    sleep(Duration::from_secs(16)).await;
    // A lost approval would have re-blocked at the meter charge that
    // crossed the threshold; the latched gate keeps the session active.
    assert_eq!(reader.snapshot().phase, Phase::Active);
    tx.send(Signal::End).expect("send");
    let receipt = handle.await.expect("join").expect("run");

    assert_eq!(receipt.phase, Phase::Ended);
    assert_eq!(receipt.tokens.total, 14);
    assert_eq!(
        gateway
            .events()
            .await
            .iter()
            .filter(|event| event.category == ChargeCategory::Time)
            .count(),
        2
    );
}

/// A crash during the approval wait resumes into the wait itself: the
/// recovered session re-blocks before the meter can charge again.
#[tokio::test(start_paused = true)]
async fn test_resume_while_blocked_reblocks_before_metering() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("ride.journal");
    let gateway = sim_gateway();
    let mut config = GlideConfig::default();
    config.session.approval_threshold = 12;

    // First run: cross the threshold, block, and abort while waiting.
    let (_tx, rx) = mpsc::unbounded_channel();
    let (machine, reader) = SessionMachine::start(
        request(),
        &config,
        gateway.clone(),
        Box::new(FileJournal::open(&path).expect("journal")),
        rx,
    );
    let handle = tokio::spawn(machine.run());
    sleep(Duration::from_secs(16)).await;
    assert_eq!(reader.snapshot().phase, Phase::Blocked);
    handle.abort();
    sleep(Duration::from_millis(1)).await;

    // Second run: approval is still owed, so the session re-enters the
    // wait at once. A full meter interval passes without a charge.
    let (tx, rx) = mpsc::unbounded_channel();
    let (machine, reader) = SessionMachine::resume(
        &config,
        gateway.clone(),
        Box::new(FileJournal::open(&path).expect("journal")),
        rx,
    )
    .expect("resumable journal");

    let handle = tokio::spawn(machine.run());
    sleep(Duration::from_secs(16)).await;
    let snapshot = reader.snapshot();
    assert_eq!(snapshot.phase, Phase::Blocked);
    assert_eq!(snapshot.tokens.total, 12);

    // Approval releases the gate; the lapsed meter charge lands after.
    tx.send(Signal::Approve).expect("send");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(reader.snapshot().phase, Phase::Active);
    tx.send(Signal::End).expect("send");
    let receipt = handle.await.expect("join").expect("run");

    assert_eq!(receipt.phase, Phase::Ended);
    assert_eq!(receipt.tokens.total, 14);
    assert_eq!(
        gateway
            .events()
            .await
            .iter()
            .filter(|event| event.category == ChargeCategory::Time)
            .count(),
        2
    );
    assert_eq!(gateway.closed_sessions().await.len(), 1);
}
