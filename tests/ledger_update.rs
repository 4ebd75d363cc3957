//! Two-party ledger channel lifecycle over the loopback bus.

mod common;

use std::sync::Arc;

use rand::{rngs::StdRng, SeedableRng};

use common::*;
use paychan::adjudicator::MultiAdjudicator;
use paychan::channel::{state_hash, AllocationError, MachineError};
use paychan::client::Error;
use paychan::{wallet, U256};

const CHAIN: u64 = 1337;

/// Keeps both clients (and their receive loops) alive for the test.
#[allow(dead_code)]
struct Setup {
    alice: TestClient,
    bob: TestClient,
}

async fn setup() -> (Setup, Arc<paychan::client::Channel>, Arc<paychan::client::Channel>) {
    let mut rng = StdRng::seed_from_u64(0x1ed6e5);
    let bus = TestBus::new();
    let adjudicator = Arc::new(MultiAdjudicator::new());
    adjudicator.register_backend(U256::from(CHAIN), MockChain::new());

    let mut alice = spawn_client("alice", &mut rng, &bus, adjudicator.clone(), Arc::new(NoopFunder));
    let mut bob = spawn_client("bob", &mut rng, &bus, adjudicator, Arc::new(NoopFunder));

    let ch_alice = alice
        .client
        .propose_channel(ledger_proposal(&bob.wire_addr, CHAIN, [10, 10]))
        .await
        .expect("opening channel failed");
    let ch_bob = bob.accepted.recv().await.expect("bob got no channel");

    (Setup { alice, bob }, ch_alice, ch_bob)
}

#[tokio::test]
async fn two_party_update_accepted() {
    let (_setup, ch_alice, ch_bob) = setup().await;

    assert_eq!(bals_of(&ch_alice.state().await.unwrap()), [10, 10]);
    assert_eq!(ch_bob.state().await.unwrap().version, 0);

    // Alice pays Bob 3.
    ch_alice
        .update_by(|state| {
            state.allocation.balances = balances(&[&[7, 13]]);
            Ok(())
        })
        .await
        .expect("update failed");

    let state = ch_alice.state().await.unwrap();
    assert_eq!(state.version, 1);
    assert_eq!(bals_of(&state), [7, 13]);
    assert_eq!(
        state.allocation.balances.sum(),
        vec![U256::from(20u64)],
        "funds must be conserved"
    );

    // Bob converges to the same state.
    let bob_state = ch_bob.state().await.unwrap();
    assert_eq!(bob_state, state);

    // Both signatures verify against the participants.
    let signed = ch_alice.signed_state().await.unwrap();
    let hash = state_hash(&signed.params, &signed.state).unwrap();
    for (i, sig) in signed.sigs.iter().enumerate() {
        assert!(
            wallet::verify(hash, signed.params.participants[i], sig),
            "signature {i} does not verify"
        );
    }
}

#[tokio::test]
async fn invalid_allocation_is_rejected_locally_and_rolled_back() {
    let (_setup, ch_alice, ch_bob) = setup().await;

    // Buggy update mints one coin out of thin air.
    let err = ch_alice
        .update_by(|state| {
            state.allocation.balances = balances(&[&[21, 20]]);
            Ok(())
        })
        .await
        .expect_err("conservation violation must fail");
    assert!(matches!(
        err,
        Error::Machine(MachineError::Allocation(AllocationError::InvalidAllocation))
    ));

    // The staged update was discarded; the channel is fully usable and
    // the next update gets version 1.
    assert_eq!(ch_alice.state().await.unwrap().version, 0);

    ch_bob
        .update_by(|state| {
            state.allocation.balances = balances(&[&[12, 8]]);
            Ok(())
        })
        .await
        .expect("follow-up update failed");

    let state = ch_alice.state().await.unwrap();
    assert_eq!(state.version, 1);
    assert_eq!(bals_of(&state), [12, 8]);
}

#[tokio::test]
async fn peer_rejection_rolls_back() {
    let (setup, ch_alice, _ch_bob) = setup().await;

    setup
        .bob
        .client
        .set_update_handler(Arc::new(RejectAllUpdates("not today")));

    let err = ch_alice
        .update_by(|state| {
            state.allocation.balances = balances(&[&[7, 13]]);
            Ok(())
        })
        .await
        .expect_err("rejected update must fail");
    match err {
        Error::PeerRejected(reason) => assert_eq!(reason, "not today"),
        other => panic!("expected PeerRejected, got {other:?}"),
    }
    assert_eq!(ch_alice.state().await.unwrap().version, 0);

    // Back to accepting: the same update now goes through at version 1.
    setup.bob.client.set_update_handler(Arc::new(AcceptAllUpdates));
    ch_alice
        .update_by(|state| {
            state.allocation.balances = balances(&[&[7, 13]]);
            Ok(())
        })
        .await
        .expect("update after re-accepting failed");
    assert_eq!(ch_alice.state().await.unwrap().version, 1);
}

#[tokio::test]
async fn cooperative_close_marks_final() {
    let (_setup, ch_alice, ch_bob) = setup().await;

    ch_alice.close().await.expect("close failed");

    let state = ch_bob.state().await.unwrap();
    assert!(state.is_final);
    assert_eq!(state.version, 1);

    // No further updates on a final channel.
    let err = ch_alice
        .update_by(|state| {
            state.allocation.balances = balances(&[&[1, 19]]);
            Ok(())
        })
        .await
        .expect_err("update on final channel must fail");
    assert!(matches!(err, Error::Machine(MachineError::AlreadyFinal)));
}

#[tokio::test]
async fn on_update_publishes_transition() {
    let (_setup, ch_alice, _ch_bob) = setup().await;

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    ch_alice.on_update(move |from, to| {
        sink.lock().unwrap().push((from.version, to.version));
    });

    ch_alice
        .update_by(|state| {
            state.allocation.balances = balances(&[&[9, 11]]);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(seen.lock().unwrap().as_slice(), &[(0, 1)]);
}
