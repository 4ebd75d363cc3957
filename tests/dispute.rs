//! Disputes and on-chain settlement against the in-memory chain backend.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use rand::{rngs::StdRng, SeedableRng};

use common::*;
use paychan::adjudicator::{
    Adjudicator, AdjudicatorEvent, AdjudicatorReq, ChainBackend, ChainError, MultiAdjudicator,
};
use paychan::client::{AdjudicatorEventHandler, Error};
use paychan::U256;

const CHAIN_A: u64 = 1337;
const CHAIN_B: u64 = 1338;

struct EventLog(Mutex<Vec<AdjudicatorEvent>>);

impl AdjudicatorEventHandler for EventLog {
    fn handle_event(&self, event: AdjudicatorEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn stale_registration_is_refuted() {
    let mut rng = StdRng::seed_from_u64(0xd15b07e);
    let bus = TestBus::new();
    let chain = MockChain::new();
    let adjudicator = Arc::new(MultiAdjudicator::new());
    adjudicator.register_backend(U256::from(CHAIN_A), chain.clone());

    let alice = spawn_client("alice", &mut rng, &bus, adjudicator.clone(), Arc::new(NoopFunder));
    let mut bob = spawn_client("bob", &mut rng, &bus, adjudicator, Arc::new(NoopFunder));

    let ch_alice = alice
        .client
        .propose_channel(ledger_proposal(&bob.wire_addr, CHAIN_A, [10, 10]))
        .await
        .unwrap();
    let ch_bob = bob.accepted.recv().await.unwrap();

    // Watch before anything can happen on chain.
    let log = Arc::new(EventLog(Mutex::new(Vec::new())));
    let watcher = alice
        .client
        .spawn_watcher(Arc::clone(&ch_alice), Arc::clone(&log) as _);

    // Agree up to version 5, remembering Bob's stale version 3.
    let mut stale = None;
    for version in 1..=5u64 {
        ch_alice
            .update_by(move |state| {
                state.allocation.balances = balances(&[&[10 - version, 10 + version]]);
                Ok(())
            })
            .await
            .unwrap();
        if version == 3 {
            stale = Some(ch_bob.signed_state().await.unwrap());
        }
    }
    let stale = stale.unwrap();
    assert_eq!(ch_alice.state().await.unwrap().version, 5);

    // Bob registers the outdated version 3 directly on chain.
    chain
        .submit(paychan::adjudicator::AdjudicatorCall::Register {
            channel: stale,
            sub_channels: vec![],
        })
        .await
        .unwrap();

    // The watcher observes Registered(3) < 5 and refutes with version 5.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    loop {
        if let Some(on_chain) = chain.on_chain(ch_alice.id()) {
            if on_chain.version == 5 {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline, "refutation did not happen");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    // Settling now pays out the refuted version 5.
    ch_alice.settle(false).await.expect("settle failed");
    let on_chain = chain.on_chain(ch_alice.id()).unwrap();
    assert_eq!(on_chain.phase, OnChainPhase::Concluded);
    assert_eq!(on_chain.version, 5);

    // The handler saw both registrations.
    let events = log.0.lock().unwrap();
    let versions: Vec<u64> = events.iter().map(AdjudicatorEvent::version).collect();
    assert!(versions.contains(&3) || versions.contains(&5));
    drop(events);
    watcher.abort();
}

async fn multi_backend_setup(
    rng: &mut StdRng,
) -> (
    Arc<MockChain>,
    Arc<MockChain>,
    TestClient,
    TestClient,
    Arc<paychan::client::Channel>,
    Arc<paychan::client::Channel>,
) {
    let bus = TestBus::new();
    let chain_a = MockChain::new();
    let chain_b = MockChain::new();
    let adjudicator = Arc::new(MultiAdjudicator::new());
    adjudicator.register_backend(U256::from(CHAIN_A), chain_a.clone());
    adjudicator.register_backend(U256::from(CHAIN_B), chain_b.clone());

    let alice = spawn_client("alice", rng, &bus, adjudicator.clone(), Arc::new(NoopFunder));
    let mut bob = spawn_client("bob", rng, &bus, adjudicator, Arc::new(NoopFunder));

    // One channel holding an asset on each chain.
    let prop = paychan::client::ChannelProposal {
        peer: bob.wire_addr.clone(),
        challenge_duration: 60,
        init_allocation: two_party_alloc(
            vec![asset(CHAIN_A), asset(CHAIN_B)],
            &[&[10, 10], &[4, 6]],
        ),
        app_data: vec![],
        virtual_data: None,
    };
    let ch_alice = alice.client.propose_channel(prop).await.unwrap();
    let ch_bob = bob.accepted.recv().await.unwrap();

    (chain_a, chain_b, alice, bob, ch_alice, ch_bob)
}

#[tokio::test]
async fn settle_concludes_on_every_backend() {
    let mut rng = StdRng::seed_from_u64(0x5e771e);
    let (chain_a, chain_b, _alice, _bob, ch_alice, _ch_bob) = multi_backend_setup(&mut rng).await;

    ch_alice.close().await.unwrap();
    ch_alice.settle(false).await.expect("settle failed");

    for chain in [&chain_a, &chain_b] {
        let on_chain = chain.on_chain(ch_alice.id()).expect("not on chain");
        assert_eq!(on_chain.phase, OnChainPhase::Concluded);
    }
}

#[tokio::test]
async fn dead_backend_fails_settle_without_partial_success() {
    let mut rng = StdRng::seed_from_u64(0x5e772e);
    let (_chain_a, chain_b, _alice, _bob, ch_alice, _ch_bob) = multi_backend_setup(&mut rng).await;

    ch_alice.close().await.unwrap();
    chain_b.kill();

    let err = ch_alice.settle(false).await.expect_err("settle must fail");
    assert!(matches!(err, Error::Chain(ChainError::ChainUnreachable)));
}

#[tokio::test]
async fn secondary_waits_for_initiator_conclude() {
    let mut rng = StdRng::seed_from_u64(0x5e773e);
    let bus = TestBus::new();
    let chain = MockChain::new();
    let adjudicator = Arc::new(MultiAdjudicator::new());
    adjudicator.register_backend(U256::from(CHAIN_A), chain.clone());

    let alice = spawn_client("alice", &mut rng, &bus, adjudicator.clone(), Arc::new(NoopFunder));
    let mut bob = spawn_client("bob", &mut rng, &bus, adjudicator, Arc::new(NoopFunder));

    let ch_alice = alice
        .client
        .propose_channel(ledger_proposal(&bob.wire_addr, CHAIN_A, [10, 10]))
        .await
        .unwrap();
    let ch_bob = bob.accepted.recv().await.unwrap();
    ch_alice.close().await.unwrap();

    // Bob settles as the secondary party: he must not submit while the
    // initiator's conclude can still arrive.
    let bob_settle = tokio::spawn(async move { ch_bob.settle(true).await });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    chain.advance_blocks(1);
    assert_eq!(chain.conclude_submissions.load(Ordering::SeqCst), 0);

    ch_alice.settle(false).await.expect("initiator settle failed");
    bob_settle.await.unwrap().expect("secondary settle failed");

    // Only the initiator sent a transaction.
    assert_eq!(chain.conclude_submissions.load(Ordering::SeqCst), 1);
    assert_eq!(
        chain.on_chain(ch_alice.id()).unwrap().phase,
        OnChainPhase::Concluded
    );
}

#[tokio::test]
async fn register_requires_backend_for_every_asset() {
    let mut rng = StdRng::seed_from_u64(0x5e774e);
    let bus = TestBus::new();
    // Only chain A gets a backend; the channel also holds a chain-B asset.
    let adjudicator = Arc::new(MultiAdjudicator::new());
    adjudicator.register_backend(U256::from(CHAIN_A), MockChain::new());

    let alice = spawn_client("alice", &mut rng, &bus, adjudicator.clone(), Arc::new(NoopFunder));
    let mut bob = spawn_client("bob", &mut rng, &bus, adjudicator.clone(), Arc::new(NoopFunder));

    let prop = paychan::client::ChannelProposal {
        peer: bob.wire_addr.clone(),
        challenge_duration: 60,
        init_allocation: two_party_alloc(
            vec![asset(CHAIN_A), asset(CHAIN_B)],
            &[&[10, 10], &[4, 6]],
        ),
        app_data: vec![],
        virtual_data: None,
    };
    let ch_alice = alice.client.propose_channel(prop).await.unwrap();
    let _ch_bob = bob.accepted.recv().await.unwrap();

    let signed = ch_alice.signed_state().await.unwrap();
    let req = AdjudicatorReq {
        params: signed.params.clone(),
        idx: 0,
        tx: signed,
        secondary: false,
    };
    let err = adjudicator.register(req, &[]).await.expect_err("must fail");
    assert!(matches!(err, ChainError::NoBackendForChain(id) if id == U256::from(CHAIN_B)));
}
