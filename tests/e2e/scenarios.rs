//! Walkthroughs of the four acceptance scenarios, run across a customer
//! device and a staff terminal that share only storage and the signing key.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use super::TestHarness;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Duration;
use exit_pass::checkout::Fulfillment;
use exit_pass::token::{pickup, PickupPass, PICKUP_PASS_PREFIX};
use exit_pass::verification::{CredentialKind, FlagReason, RecordSource, StaffAction};
use exit_pass::{Clock, PassVerification, ScanOutcome, TokenError, TransactionStatus, VerificationState};

fn completed(outcome: ScanOutcome) -> VerificationState {
    match outcome {
        ScanOutcome::Completed(state) => state,
        ScanOutcome::Dropped => VerificationState::Idle,
    }
}

/// Test 1: A low-risk purchase is shown as SUCCESS and release marks it
/// verified and redeemed.
#[tokio::test]
async fn test_scenario_a_clean_release() {
    let harness = TestHarness::setup().expect("setup");
    let (record, pass) = harness.paid_with_risk("tx-a", 20).await.expect("paid");
    assert_eq!(record.total, 450);
    assert_eq!(record.item_count(), 3);

    let terminal = harness.staff().terminal();
    let state = completed(terminal.handle(&pass.token).await.expect("scan"));

    assert_eq!(state.name(), "SUCCESS");
    let decision = state.decision().expect("decision");
    assert_eq!(decision.source, RecordSource::Ledger);
    assert_eq!(decision.credential, CredentialKind::ExitPass);
    assert_eq!(decision.item_count, 3);
    assert_eq!(decision.record.total, 450);
    assert!(decision.reasons.is_empty());

    let outcome = terminal.release("staff-7").await.expect("release");
    assert_eq!(outcome.action, StaffAction::Release);
    assert!(outcome.ledger_updated());
    assert_eq!(terminal.state(), VerificationState::Idle);

    // The customer's own ledger instance reads the staff write from storage.
    let stored = harness
        .customer()
        .ledger()
        .lookup("tx-a")
        .await
        .expect("lookup")
        .expect("record");
    assert_eq!(stored.status, TransactionStatus::Verified);
    assert!(stored.pass_redeemed);
    assert_eq!(stored.verified_by.as_deref(), Some("staff-7"));
    assert!(stored.verified_at.is_some());
    assert!(stored.redeemed_at.is_some());
}

/// Test 2: A high-risk purchase is FLAGGED and a full audit keeps it flagged
/// with the staff notes.
#[tokio::test]
async fn test_scenario_b_flagged_full_audit() {
    let harness = TestHarness::setup().expect("setup");
    let (_, pass) = harness.paid_with_risk("tx-b", 80).await.expect("paid");

    let terminal = harness.staff().terminal();
    let state = completed(terminal.handle(&pass.token).await.expect("scan"));

    assert_eq!(state.name(), "FLAGGED");
    let decision = state.decision().expect("decision");
    assert_eq!(
        decision.reasons,
        vec![FlagReason::HighRisk {
            score: 80,
            threshold: 65
        }]
    );

    let outcome = terminal
        .full_audit("staff-2", "bag checked, all items paid")
        .await
        .expect("audit");
    assert_eq!(outcome.action, StaffAction::FullAudit);
    assert!(outcome.ledger_updated());

    let stored = harness
        .customer()
        .ledger()
        .lookup("tx-b")
        .await
        .expect("lookup")
        .expect("record");
    assert_eq!(stored.status, TransactionStatus::Flagged);
    assert!(stored.pass_redeemed);
    assert_eq!(
        stored.audit_notes.as_deref(),
        Some("bag checked, all items paid")
    );
}

/// Test 3: A pass past its TTL is EXPIRED at the gate and a refreshed pass
/// scans cleanly.
#[tokio::test]
async fn test_scenario_c_expiry_and_refresh() {
    let harness = TestHarness::setup().expect("setup");
    let (record, _) = harness.paid_with_risk("tx-c", 20).await.expect("paid");

    let short = harness
        .customer()
        .tokens()
        .issue_with_ttl(&record, Duration::seconds(1))
        .expect("issue");
    harness.advance(2);

    assert!(harness.staff().tokens().verify(&short.token).is_expired());
    let terminal = harness.staff().terminal();
    let state = completed(terminal.handle(&short.token).await.expect("scan"));
    assert_eq!(state.name(), "EXPIRED");
    assert!(matches!(
        state,
        VerificationState::Expired { ref transaction_id, .. } if transaction_id == "tx-c"
    ));
    terminal.reset().expect("reset");

    let fresh = harness
        .customer()
        .checkout()
        .refresh_pass("tx-c")
        .await
        .expect("refresh");
    assert!(fresh.expires_at > harness.clock().now());
    assert!(harness.staff().tokens().verify(&fresh.token).is_valid());

    let state = completed(terminal.handle(&fresh.token).await.expect("scan"));
    assert_eq!(state.name(), "SUCCESS");
}

/// Test 4: A pickup pass whose total was altered fails the checksum and
/// lands in NOT_FOUND.
#[tokio::test]
async fn test_scenario_d_corrupted_pickup_pass() {
    let harness = TestHarness::setup().expect("setup");
    let done = harness.checkout(Fulfillment::Pickup).await.expect("checkout");
    let encoded = done.pickup_pass.expect("pickup pass");

    let mut pass = pickup::decode(&encoded)
        .into_payload()
        .expect("fresh pickup pass decodes");
    pass.total += 1;
    let corrupted = reencode(&pass);

    assert_eq!(
        pickup::decode(&corrupted),
        PassVerification::Invalid(TokenError::ChecksumMismatch)
    );

    let terminal = harness.staff().terminal();
    let state = completed(terminal.handle(&corrupted).await.expect("scan"));
    assert_eq!(
        state,
        VerificationState::NotFound {
            error: TokenError::ChecksumMismatch
        }
    );
    assert_eq!(TokenError::ChecksumMismatch.to_string(), "Checksum mismatch");

    // The untouched pass still finds the order.
    terminal.reset().expect("reset");
    let state = completed(terminal.handle(&encoded).await.expect("scan"));
    let decision = state.decision().expect("decision");
    assert_eq!(decision.credential, CredentialKind::PickupPass);
    assert_eq!(decision.record.id, done.record.id);
}

/// Test 5: Staff can type the pickup code instead of scanning.
#[tokio::test]
async fn test_pickup_code_typed_in() {
    let harness = TestHarness::setup().expect("setup");
    let done = harness.checkout(Fulfillment::Pickup).await.expect("checkout");
    let code = done.record.pickup_code.clone().expect("code");

    let terminal = harness.staff().terminal();
    let state = completed(
        terminal
            .handle(&format!("  {}  ", code.to_lowercase()))
            .await
            .expect("scan"),
    );
    let decision = state.decision().expect("decision");
    assert_eq!(decision.credential, CredentialKind::PickupCode);
    assert_eq!(decision.record.id, done.record.id);
}

fn reencode(pass: &PickupPass) -> String {
    let json = serde_json::to_vec(pass).expect("json");
    format!("{PICKUP_PASS_PREFIX}{}", STANDARD.encode(json))
}
