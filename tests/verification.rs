// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use keyverify::identifiers::{DeviceId, TransactionId, UserId};
use keyverify::liveness::{LivenessConfig, now_millis};
use keyverify::test_utils::{MemoryKeyStore, MemoryTransport, MemoryTrustStore};
use keyverify::{
    AcceptContent, AttemptInfo, CancelCode, DoneContent, HASH_ALGORITHM, KEY_AGREEMENT_PROTOCOL,
    KeyContent, MAC_ALGORITHM, ReadyContent, Role, SasState, ShortAuthenticationString,
    StartContent, StepContent, Verification, VerificationMethod, VerificationState,
    VerificationStep,
};

const TXN: &str = "txn-1";

struct Party {
    user: UserId,
    device: DeviceId,
    attempt: Arc<Verification>,
    transport: Arc<MemoryTransport>,
    trust: Arc<MemoryTrustStore>,
}

fn party(
    own: (&str, &str),
    peer: (&str, Option<&str>),
    role: Role,
    keys: Arc<MemoryKeyStore>,
    config: LivenessConfig,
    created_at: u64,
) -> Party {
    let transport = Arc::new(MemoryTransport::new());
    let trust = Arc::new(MemoryTrustStore::new());
    let attempt = Verification::new(
        AttemptInfo {
            own_user: own.0.into(),
            own_device: own.1.into(),
            their_user: peer.0.into(),
            their_device: peer.1.map(DeviceId::from),
            transaction: TransactionId::opaque(TXN),
            created_at,
            methods: vec![VerificationMethod::Sas],
        },
        role,
        transport.clone(),
        trust.clone(),
        keys,
        config,
    );
    Party {
        user: own.0.into(),
        device: own.1.into(),
        attempt,
        transport,
        trust,
    }
}

/// Requester alice and recipient bob, each with their own and the peer's identity keys known.
fn pair() -> (Party, Party) {
    let keys = Arc::new(MemoryKeyStore::new());
    keys.insert("@alice:example.org", "ALICEDEV", "ed25519:ALICEDEV", "alice+identity+key");
    keys.insert("@bob:example.org", "BOBDEV", "ed25519:BOBDEV", "bob+identity+key");

    let config = LivenessConfig::default();
    let now = now_millis();
    let alice = party(
        ("@alice:example.org", "ALICEDEV"),
        ("@bob:example.org", None),
        Role::Requester,
        keys.clone(),
        config,
        now,
    );
    let bob = party(
        ("@bob:example.org", "BOBDEV"),
        ("@alice:example.org", Some("ALICEDEV")),
        Role::Recipient,
        keys,
        config,
        now,
    );
    (alice, bob)
}

/// Relays queued outbound steps between the two parties until both outboxes stay empty.
async fn pump(a: &Party, b: &Party) {
    loop {
        let mut moved = false;
        for step in a.transport.drain() {
            moved = true;
            b.attempt.submit_step(&a.user, step, false).await;
        }
        for step in b.transport.drain() {
            moved = true;
            a.attempt.submit_step(&b.user, step, false).await;
        }
        if !moved {
            break;
        }
    }
}

fn state(party: &Party) -> VerificationState {
    party.attempt.state().borrow().clone()
}

fn comparison_codes(party: &Party) -> ([u16; 3], Vec<&'static str>) {
    match state(party) {
        VerificationState::Started {
            sas: SasState::ComparisonReady { decimal, emoji },
            ..
        } => (decimal, emoji.iter().map(|e| e.description).collect()),
        other => panic!("expected comparison, got {other:?}"),
    }
}

/// Drives a fresh pair through ready and key exchange up to the code comparison.
async fn compared_pair() -> (Party, Party) {
    let (alice, bob) = pair();
    bob.attempt.accept_request().await.unwrap();
    pump(&alice, &bob).await;
    alice.attempt.start_sas().await.unwrap();
    pump(&alice, &bob).await;
    assert_eq!(comparison_codes(&alice), comparison_codes(&bob));
    (alice, bob)
}

fn sas_start(from_device: &str) -> StepContent {
    StepContent::Start(StartContent {
        from_device: from_device.into(),
        method: VerificationMethod::Sas,
        key_agreement_protocols: vec![KEY_AGREEMENT_PROTOCOL.to_owned()],
        hashes: vec![HASH_ALGORITHM.to_owned()],
        message_authentication_codes: vec![MAC_ALGORITHM.to_owned()],
        short_authentication_string: vec![
            ShortAuthenticationString::Decimal,
            ShortAuthenticationString::Emoji,
        ],
    })
}

fn step(content: StepContent) -> VerificationStep {
    VerificationStep::new(TransactionId::opaque(TXN), content)
}

#[tokio::test]
async fn full_verification_reaches_done_on_both_sides() {
    let (alice, bob) = pair();

    bob.attempt.accept_request().await.unwrap();
    pump(&alice, &bob).await;
    assert_matches!(state(&alice), VerificationState::Ready { .. });
    assert_matches!(state(&bob), VerificationState::Ready { .. });

    alice.attempt.start_sas().await.unwrap();
    pump(&alice, &bob).await;
    assert_eq!(comparison_codes(&alice), comparison_codes(&bob));

    alice.attempt.confirm_sas_match().await.unwrap();
    pump(&alice, &bob).await;
    assert_matches!(
        state(&bob),
        VerificationState::Started {
            sas: SasState::AwaitingMacs { own: false },
            ..
        }
    );

    bob.attempt.confirm_sas_match().await.unwrap();
    pump(&alice, &bob).await;
    assert_eq!(state(&alice), VerificationState::Done);
    assert_eq!(state(&bob), VerificationState::Done);

    // Exactly one key marked as verified per side.
    assert_eq!(
        alice.trust.verified(),
        vec![(bob.user.clone(), bob.device.clone(), "ed25519:BOBDEV".to_owned())]
    );
    assert_eq!(
        bob.trust.verified(),
        vec![(alice.user.clone(), alice.device.clone(), "ed25519:ALICEDEV".to_owned())]
    );
}

#[tokio::test]
async fn unsupported_accept_cancels_before_any_key_is_sent() {
    let (alice, bob) = pair();
    bob.attempt.accept_request().await.unwrap();
    pump(&alice, &bob).await;
    alice.attempt.start_sas().await.unwrap();
    alice.transport.drain();

    let accept = step(StepContent::Accept(AcceptContent {
        method: VerificationMethod::Sas,
        key_agreement_protocol: "curve448-hkdf-sha512".to_owned(),
        hash: HASH_ALGORITHM.to_owned(),
        message_authentication_code: MAC_ALGORITHM.to_owned(),
        short_authentication_string: vec![ShortAuthenticationString::Emoji],
        commitment: "bm90IGEgcmVhbCBjb21taXRtZW50".to_owned(),
    }));
    alice.attempt.submit_step(&bob.user, accept, false).await;

    assert_matches!(
        state(&alice),
        VerificationState::Cancelled {
            code: CancelCode::UnknownMethod,
            by_us: true,
            ..
        }
    );
    let sent = alice.transport.drain();
    assert!(
        sent.iter()
            .all(|step| matches!(step.content, StepContent::Cancel(_))),
        "no key step may leave the device, got {sent:?}"
    );
}

#[tokio::test]
async fn premature_mac_cancels_with_unexpected_message() {
    let (alice, bob) = pair();
    bob.attempt.accept_request().await.unwrap();
    pump(&alice, &bob).await;
    alice.attempt.start_sas().await.unwrap();
    alice.transport.drain();

    let mac = step(StepContent::Mac(keyverify::MacContent {
        keys: "bWFj".to_owned(),
        mac: Default::default(),
    }));
    alice.attempt.submit_step(&bob.user, mac, false).await;

    assert_matches!(
        state(&alice),
        VerificationState::Cancelled {
            code: CancelCode::UnexpectedMessage,
            by_us: true,
            ..
        }
    );
}

#[tokio::test]
async fn simultaneous_starts_pick_the_greater_user() {
    let (alice, bob) = pair();
    bob.attempt.accept_request().await.unwrap();
    pump(&alice, &bob).await;

    // Both sides start before seeing the other's start.
    alice.attempt.start_sas().await.unwrap();
    bob.attempt.start_sas().await.unwrap();
    pump(&alice, &bob).await;

    // "@bob:example.org" > "@alice:example.org", so bob's run wins on both sides.
    for side in [&alice, &bob] {
        assert_matches!(
            state(side),
            VerificationState::Started { ref sender, .. } if sender == &bob.user
        );
    }
    assert_eq!(comparison_codes(&alice), comparison_codes(&bob));

    // The surviving run completes normally.
    alice.attempt.confirm_sas_match().await.unwrap();
    pump(&alice, &bob).await;
    bob.attempt.confirm_sas_match().await.unwrap();
    pump(&alice, &bob).await;
    assert_eq!(state(&alice), VerificationState::Done);
    assert_eq!(state(&bob), VerificationState::Done);
}

#[tokio::test]
async fn simultaneous_starts_between_own_devices_pick_the_greater_device() {
    // Self-verification: the same user on devices "X" and "Y".
    let keys = Arc::new(MemoryKeyStore::new());
    keys.insert("@carol:example.org", "X", "ed25519:X", "carol+key+x");
    keys.insert("@carol:example.org", "Y", "ed25519:Y", "carol+key+y");
    let config = LivenessConfig::default();
    let now = now_millis();
    let x = party(
        ("@carol:example.org", "X"),
        ("@carol:example.org", None),
        Role::Requester,
        keys.clone(),
        config,
        now,
    );
    let y = party(
        ("@carol:example.org", "Y"),
        ("@carol:example.org", Some("X")),
        Role::Recipient,
        keys,
        config,
        now,
    );

    y.attempt.accept_request().await.unwrap();
    pump(&x, &y).await;
    x.attempt.start_sas().await.unwrap();
    y.attempt.start_sas().await.unwrap();
    pump(&x, &y).await;

    for side in [&x, &y] {
        assert_matches!(
            state(side),
            VerificationState::Started { ref device, .. } if device == &y.device
        );
    }
    assert_eq!(comparison_codes(&x), comparison_codes(&y));
}

#[tokio::test]
async fn mismatched_commitment_cancels() {
    let (alice, bob) = pair();
    bob.attempt.accept_request().await.unwrap();
    pump(&alice, &bob).await;
    alice.attempt.start_sas().await.unwrap();
    alice.transport.drain();

    let accept = step(StepContent::Accept(AcceptContent {
        method: VerificationMethod::Sas,
        key_agreement_protocol: KEY_AGREEMENT_PROTOCOL.to_owned(),
        hash: HASH_ALGORITHM.to_owned(),
        message_authentication_code: MAC_ALGORITHM.to_owned(),
        short_authentication_string: vec![ShortAuthenticationString::Emoji],
        commitment: "bm90IHRoZSByaWdodCBjb21taXRtZW50IGF0IGFsbA".to_owned(),
    }));
    alice.attempt.submit_step(&bob.user, accept, false).await;
    assert_matches!(
        state(&alice),
        VerificationState::Started {
            sas: SasState::AwaitingKeys { own: true },
            ..
        }
    );

    // A syntactically valid key that cannot match the bogus commitment.
    let key = step(StepContent::Key(KeyContent {
        key: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_owned(),
    }));
    alice.attempt.submit_step(&bob.user, key, false).await;

    assert_matches!(
        state(&alice),
        VerificationState::Cancelled {
            code: CancelCode::MismatchedCommitment,
            by_us: true,
            ..
        }
    );
}

#[tokio::test]
async fn rejecting_the_comparison_cancels_both_sides() {
    let (alice, bob) = compared_pair().await;

    alice.attempt.reject_sas_match().await.unwrap();
    pump(&alice, &bob).await;

    assert_matches!(
        state(&alice),
        VerificationState::Cancelled {
            code: CancelCode::MismatchedSas,
            by_us: true,
            ..
        }
    );
    assert_matches!(
        state(&bob),
        VerificationState::Cancelled {
            code: CancelCode::MismatchedSas,
            by_us: false,
            ..
        }
    );
}

#[tokio::test]
async fn wrong_local_key_copy_cancels_with_key_mismatch() {
    // Bob's local copy of alice's identity key is wrong.
    let alice_keys = Arc::new(MemoryKeyStore::new());
    alice_keys.insert("@alice:example.org", "ALICEDEV", "ed25519:ALICEDEV", "alice+identity+key");
    alice_keys.insert("@bob:example.org", "BOBDEV", "ed25519:BOBDEV", "bob+identity+key");
    let bob_keys = Arc::new(MemoryKeyStore::new());
    bob_keys.insert("@alice:example.org", "ALICEDEV", "ed25519:ALICEDEV", "someone+else");
    bob_keys.insert("@bob:example.org", "BOBDEV", "ed25519:BOBDEV", "bob+identity+key");

    let config = LivenessConfig::default();
    let now = now_millis();
    let alice = party(
        ("@alice:example.org", "ALICEDEV"),
        ("@bob:example.org", None),
        Role::Requester,
        alice_keys,
        config,
        now,
    );
    let bob = party(
        ("@bob:example.org", "BOBDEV"),
        ("@alice:example.org", Some("ALICEDEV")),
        Role::Recipient,
        bob_keys,
        config,
        now,
    );

    bob.attempt.accept_request().await.unwrap();
    pump(&alice, &bob).await;
    alice.attempt.start_sas().await.unwrap();
    pump(&alice, &bob).await;

    alice.attempt.confirm_sas_match().await.unwrap();
    pump(&alice, &bob).await;
    bob.attempt.confirm_sas_match().await.unwrap();
    pump(&alice, &bob).await;

    assert_matches!(
        state(&bob),
        VerificationState::Cancelled {
            code: CancelCode::KeyMismatch,
            by_us: true,
            ..
        }
    );
    assert_matches!(
        state(&alice),
        VerificationState::Cancelled {
            code: CancelCode::KeyMismatch,
            by_us: false,
            ..
        }
    );
    assert!(bob.trust.verified().is_empty());
}

#[tokio::test]
async fn unknown_peer_keys_finish_without_trust_updates() {
    // Bob has no local copy of alice's keys at all; the run still completes, but nothing is
    // marked as verified on bob's side.
    let alice_keys = Arc::new(MemoryKeyStore::new());
    alice_keys.insert("@alice:example.org", "ALICEDEV", "ed25519:ALICEDEV", "alice+identity+key");
    alice_keys.insert("@bob:example.org", "BOBDEV", "ed25519:BOBDEV", "bob+identity+key");
    let bob_keys = Arc::new(MemoryKeyStore::new());
    bob_keys.insert("@bob:example.org", "BOBDEV", "ed25519:BOBDEV", "bob+identity+key");

    let config = LivenessConfig::default();
    let now = now_millis();
    let alice = party(
        ("@alice:example.org", "ALICEDEV"),
        ("@bob:example.org", None),
        Role::Requester,
        alice_keys,
        config,
        now,
    );
    let bob = party(
        ("@bob:example.org", "BOBDEV"),
        ("@alice:example.org", Some("ALICEDEV")),
        Role::Recipient,
        bob_keys,
        config,
        now,
    );

    bob.attempt.accept_request().await.unwrap();
    pump(&alice, &bob).await;
    alice.attempt.start_sas().await.unwrap();
    pump(&alice, &bob).await;
    alice.attempt.confirm_sas_match().await.unwrap();
    pump(&alice, &bob).await;
    bob.attempt.confirm_sas_match().await.unwrap();
    pump(&alice, &bob).await;

    assert_eq!(state(&alice), VerificationState::Done);
    assert_eq!(state(&bob), VerificationState::Done);
    assert!(bob.trust.verified().is_empty());
    assert_eq!(alice.trust.verified().len(), 1);
}

#[tokio::test]
async fn step_from_foreign_user_cancels_with_user_mismatch() {
    let (alice, _) = pair();
    let ready = step(StepContent::Ready(ReadyContent {
        from_device: "EVILDEV".into(),
        methods: vec![VerificationMethod::Sas],
    }));
    alice
        .attempt
        .submit_step(&"@mallory:example.org".into(), ready, false)
        .await;
    assert_matches!(
        state(&alice),
        VerificationState::Cancelled {
            code: CancelCode::UserMismatch,
            by_us: true,
            ..
        }
    );
}

#[tokio::test]
async fn step_for_foreign_transaction_cancels_with_unknown_transaction() {
    let (alice, bob) = pair();
    let ready = VerificationStep::new(
        TransactionId::opaque("some-other-txn"),
        StepContent::Ready(ReadyContent {
            from_device: bob.device.as_str().into(),
            methods: vec![VerificationMethod::Sas],
        }),
    );
    alice.attempt.submit_step(&bob.user, ready, false).await;
    assert_matches!(
        state(&alice),
        VerificationState::Cancelled {
            code: CancelCode::UnknownTransaction,
            by_us: true,
            ..
        }
    );
}

#[tokio::test]
async fn send_failure_cancels_with_internal_error() {
    let (_, bob) = pair();
    bob.transport.fail_sending();
    bob.attempt.accept_request().await.unwrap();
    assert_matches!(
        state(&bob),
        VerificationState::Cancelled {
            code: CancelCode::InternalError,
            by_us: true,
            ..
        }
    );
}

#[tokio::test]
async fn ready_from_another_own_device_parks_the_attempt() {
    let (_, bob) = pair();
    let ready = step(StepContent::Ready(ReadyContent {
        from_device: "BOBOTHERDEV".into(),
        methods: vec![VerificationMethod::Sas],
    }));
    bob.attempt.submit_step(&bob.user, ready, false).await;
    assert_eq!(state(&bob), VerificationState::AcceptedByOtherDevice);

    // Everything but done and cancel is ignored without cancelling.
    bob.attempt
        .submit_step(&"@alice:example.org".into(), step(sas_start("ALICEDEV")), false)
        .await;
    assert_eq!(state(&bob), VerificationState::AcceptedByOtherDevice);
    assert!(bob.transport.drain().is_empty());

    // A done from the winning context still closes the attempt.
    bob.attempt
        .submit_step(
            &"@alice:example.org".into(),
            step(StepContent::Done(DoneContent {})),
            false,
        )
        .await;
    assert_eq!(state(&bob), VerificationState::Done);
}

#[tokio::test]
async fn attempt_times_out_without_activity() {
    let keys = Arc::new(MemoryKeyStore::new());
    let config = LivenessConfig {
        active_window: Duration::from_millis(200),
        poll_interval: Duration::from_millis(50),
        ..LivenessConfig::default()
    };
    let alice = party(
        ("@alice:example.org", "ALICEDEV"),
        ("@bob:example.org", None),
        Role::Requester,
        keys,
        config,
        now_millis(),
    );
    alice.attempt.start_lifecycle();
    // Idempotent; a second call spawns nothing new.
    alice.attempt.start_lifecycle();

    let mut states = alice.attempt.state();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if states.borrow_and_update().is_terminal() {
                break;
            }
            states.changed().await.unwrap();
        }
    })
    .await
    .expect("attempt must terminate");

    assert_matches!(
        state(&alice),
        VerificationState::Cancelled {
            code: CancelCode::Timeout,
            by_us: true,
            ..
        }
    );
    // The outbound cancel step was still sent.
    let sent = alice.transport.drain();
    assert_matches!(sent.last().map(|s| &s.content), Some(StepContent::Cancel(_)));
}

#[tokio::test]
async fn steps_after_termination_are_ignored() {
    let (alice, bob) = pair();
    alice.attempt.cancel("changed my mind").await.unwrap();
    assert_matches!(
        state(&alice),
        VerificationState::Cancelled {
            code: CancelCode::User,
            by_us: true,
            ..
        }
    );
    alice.transport.drain();

    let ready = step(StepContent::Ready(ReadyContent {
        from_device: bob.device.as_str().into(),
        methods: vec![VerificationMethod::Sas],
    }));
    alice.attempt.submit_step(&bob.user, ready, false).await;

    // No transition, no reaction.
    assert_matches!(state(&alice), VerificationState::Cancelled { .. });
    assert!(alice.transport.drain().is_empty());

    // Further user actions report the invalid state instead of cancelling again.
    assert!(alice.attempt.cancel("again").await.is_err());
}
