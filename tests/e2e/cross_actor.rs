//! Customer and staff acting on the same transaction from separate devices.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::TestHarness;
use exit_pass::checkout::Fulfillment;
use exit_pass::verification::FlagReason;
use exit_pass::{
    Error, GateConfig, NotificationChannel, NotificationEvent, NotificationInbox,
    NotificationKind, ScanOutcome, TransactionStatus, VerificationState,
};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn fast_polling() -> GateConfig {
    GateConfig {
        poll_interval_ms: 50,
        ..GateConfig::default()
    }
}

async fn scan_ok(terminal: &exit_pass::VerificationStateMachine, token: &str) -> &'static str {
    match terminal.handle(token).await.expect("scan") {
        ScanOutcome::Completed(state) => state.name(),
        ScanOutcome::Dropped => "DROPPED",
    }
}

/// Test 1: The customer's polling subscription sees a release made by the
/// staff terminal through shared storage.
#[tokio::test]
async fn test_polling_delivers_staff_release_to_customer() {
    let harness = TestHarness::setup_with_config(fast_polling()).expect("setup");
    let (_, pass) = harness.paid_with_risk("tx-poll", 20).await.expect("paid");

    let channel = harness.customer().polling_channel();
    let mut subscription = channel.subscribe("tx-poll").await.expect("subscribe");
    assert_eq!(subscription.transaction_id(), "tx-poll");
    assert!(subscription.try_recv().is_none());

    let terminal = harness.staff().terminal();
    assert_eq!(scan_ok(&terminal, &pass.token).await, "SUCCESS");
    terminal.release("staff-1").await.expect("release");

    let event = tokio::time::timeout(WAIT, subscription.recv())
        .await
        .expect("notified in time")
        .expect("event");
    assert_eq!(event.kind, NotificationKind::GateReleased);
    assert_eq!(event.transaction_id, "tx-poll");
    subscription.unsubscribe();
}

/// Test 2: Push subscribers on the ledger the terminal writes to are told
/// once the pass is redeemed.
#[tokio::test]
async fn test_push_delivers_release() {
    let harness = TestHarness::setup().expect("setup");
    let (_, pass) = harness.paid_with_risk("tx-push", 20).await.expect("paid");

    let channel = harness.staff().push_channel();
    let mut subscription = channel.subscribe("tx-push").await.expect("subscribe");
    assert!(subscription.try_recv().is_none());

    let terminal = harness.staff().terminal();
    scan_ok(&terminal, &pass.token).await;
    terminal.release("staff-1").await.expect("release");

    let event = tokio::time::timeout(WAIT, subscription.recv())
        .await
        .expect("notified in time")
        .expect("event");
    assert_eq!(event.kind, NotificationKind::GateReleased);
    // Status and redemption were separate writes; only one event results.
    assert!(subscription.try_recv().is_none());
}

/// Test 3: A flagged audit reaches the customer as a Flagged notification and
/// the inbox drops the copy arriving over the second channel.
#[tokio::test]
async fn test_flagged_notification_deduplicated_across_channels() {
    let harness = TestHarness::setup_with_config(fast_polling()).expect("setup");
    let (_, pass) = harness.paid_with_risk("tx-flag", 90).await.expect("paid");

    let polling = harness.customer().polling_channel();
    let push = harness.staff().push_channel();
    let mut polled = polling.subscribe("tx-flag").await.expect("subscribe");
    let mut pushed = push.subscribe("tx-flag").await.expect("subscribe");

    let terminal = harness.staff().terminal();
    assert_eq!(scan_ok(&terminal, &pass.token).await, "FLAGGED");
    terminal
        .full_audit("staff-3", "receipt matched")
        .await
        .expect("audit");

    let from_push = tokio::time::timeout(WAIT, pushed.recv())
        .await
        .expect("push in time")
        .expect("event");
    let from_poll = tokio::time::timeout(WAIT, polled.recv())
        .await
        .expect("poll in time")
        .expect("event");

    let mut inbox = NotificationInbox::new();
    assert!(inbox.accept(from_push));
    assert!(!inbox.accept(from_poll));
    assert_eq!(inbox.events().len(), 1);
    let latest = inbox.latest_for("tx-flag").expect("latest");
    assert_eq!(latest.kind, NotificationKind::Flagged);
}

/// Test 4: Collecting a pickup order produces a PickupCollected notice.
#[tokio::test]
async fn test_pickup_collected_notification() {
    let harness = TestHarness::setup_with_config(fast_polling()).expect("setup");
    let done = harness.checkout(Fulfillment::Pickup).await.expect("checkout");
    let pickup_pass = done.pickup_pass.clone().expect("pickup pass");

    let mut subscription = harness
        .customer()
        .polling_channel()
        .subscribe(&done.record.id)
        .await
        .expect("subscribe");

    let terminal = harness.staff().terminal();
    let state = scan_ok(&terminal, &pickup_pass).await;
    assert!(state == "SUCCESS" || state == "FLAGGED");
    terminal.release("staff-4").await.expect("release");

    let event = tokio::time::timeout(WAIT, subscription.recv())
        .await
        .expect("notified in time")
        .expect("event");
    assert_eq!(event.kind, NotificationKind::PickupCollected);
    assert_eq!(
        Some(event),
        NotificationEvent::from_record(
            &harness
                .customer()
                .ledger()
                .lookup(&done.record.id)
                .await
                .expect("lookup")
                .expect("record")
        )
    );
}

/// Test 5: Two terminals releasing the same pass at once leave exactly one
/// write in place.
#[tokio::test]
async fn test_concurrent_release_on_two_terminals() {
    let harness = TestHarness::setup().expect("setup");
    let (_, pass) = harness.paid_with_risk("tx-race", 20).await.expect("paid");

    let second_device = harness.another_device().expect("device");
    let north = harness.staff().terminal();
    let south = second_device.terminal();
    assert_eq!(scan_ok(&north, &pass.token).await, "SUCCESS");
    assert_eq!(scan_ok(&south, &pass.token).await, "SUCCESS");

    let (a, b) = tokio::join!(north.release("staff-north"), south.release("staff-south"));
    let (a, b) = (a.expect("north"), b.expect("south"));

    let applied = [&a, &b]
        .iter()
        .filter(|o| o.status_update.is_applied())
        .count();
    assert_eq!(applied, 1);
    let redeemed = [&a, &b]
        .iter()
        .filter(|o| o.redemption.is_applied())
        .count();
    assert_eq!(redeemed, 1);

    let stored = harness
        .customer()
        .ledger()
        .lookup("tx-race")
        .await
        .expect("lookup")
        .expect("record");
    assert_eq!(stored.status, TransactionStatus::Verified);
    assert!(stored.pass_redeemed);
    let winner = if a.status_update.is_applied() { &a } else { &b };
    assert_eq!(
        winner.status_update.record().and_then(|r| r.verified_by.clone()),
        stored.verified_by
    );

    // A late third tap changes nothing.
    let verified_at = stored.verified_at;
    let late = harness
        .staff()
        .ledger()
        .update_status("tx-race", TransactionStatus::Flagged, "staff-late", None)
        .await
        .expect("update");
    assert!(!late.is_applied());
    assert_eq!(late.record().and_then(|r| r.verified_at), verified_at);
}

/// Test 6: A redeemed pass shown again is flagged and cannot be refreshed.
#[tokio::test]
async fn test_reused_pass_is_flagged() {
    let harness = TestHarness::setup().expect("setup");
    let (_, pass) = harness.paid_with_risk("tx-reuse", 10).await.expect("paid");

    let terminal = harness.staff().terminal();
    scan_ok(&terminal, &pass.token).await;
    terminal.release("staff-1").await.expect("release");

    let other = harness.another_device().expect("device").terminal();
    let state = match other.handle(&pass.token).await.expect("scan") {
        ScanOutcome::Completed(state) => state,
        ScanOutcome::Dropped => VerificationState::Idle,
    };
    assert_eq!(state.name(), "FLAGGED");
    assert!(state
        .decision()
        .expect("decision")
        .reasons
        .contains(&FlagReason::AlreadyRedeemed));

    let refreshed = harness.customer().checkout().refresh_pass("tx-reuse").await;
    assert!(matches!(refreshed, Err(Error::PassRedeemed(_))));
}
