//! In-memory test doubles: a loopback wire bus, a single-process chain,
//! and pre-canned proposal/update handlers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use tokio::sync::mpsc;

use paychan::adjudicator::{
    Adjudicator, AdjudicatorCall, AdjudicatorEvent, ChainBackend, ChainError, TxHash,
};
use paychan::channel::{Allocation, Asset, Balances, ChannelId, Params, State};
use paychan::client::{
    Channel, ChannelProposal, ChannelUpdate, ProposalHandler, ProposalResponder, UpdateHandler,
    UpdateResponder, VirtualChannelData,
};
use paychan::funder::{Funder, FundingError, FundingReq};
use paychan::wallet::Signer;
use paychan::wire::{self, Bus, BusError, Envelope};
use paychan::{Client, U256};

/// Loopback bus: every registered address gets an unbounded inbox.
pub struct TestBus {
    inboxes: Mutex<HashMap<wire::Address, mpsc::UnboundedSender<Envelope>>>,
}

impl TestBus {
    pub fn new() -> Arc<Self> {
        Arc::new(TestBus {
            inboxes: Mutex::new(HashMap::new()),
        })
    }

    pub fn register(&self, addr: wire::Address) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes.lock().unwrap().insert(addr, tx);
        rx
    }
}

#[async_trait]
impl Bus for TestBus {
    async fn publish(&self, env: Envelope) -> Result<(), BusError> {
        let tx = self
            .inboxes
            .lock()
            .unwrap()
            .get(&env.recipient)
            .cloned()
            .ok_or_else(|| BusError::UnknownRecipient(env.recipient.clone()))?;
        tx.send(env).map_err(|_| BusError::Closed)
    }
}

/// Funder that reports success without touching any chain.
pub struct NoopFunder;

#[async_trait]
impl Funder for NoopFunder {
    async fn fund(&self, _: FundingReq) -> Result<(), FundingError> {
        Ok(())
    }
}

/// Accepts every incoming proposal and hands the resulting channel to the
/// test through an unbounded queue.
pub struct ProposalSink {
    tx: mpsc::UnboundedSender<Arc<Channel>>,
}

#[async_trait]
impl ProposalHandler for ProposalSink {
    async fn handle_proposal(&self, _: wire::MsgProposal, responder: ProposalResponder) {
        match responder.accept().await {
            Ok(channel) => {
                let _ = self.tx.send(channel);
            }
            Err(err) => panic!("accepting proposal failed: {err}"),
        }
    }
}

pub struct AcceptAllUpdates;

#[async_trait]
impl UpdateHandler for AcceptAllUpdates {
    async fn handle_update(&self, _: State, _: ChannelUpdate, responder: UpdateResponder) {
        responder.accept().await.expect("accepting update failed");
    }
}

pub struct RejectAllUpdates(pub &'static str);

#[async_trait]
impl UpdateHandler for RejectAllUpdates {
    async fn handle_update(&self, _: State, _: ChannelUpdate, responder: UpdateResponder) {
        responder.reject(self.0).await.expect("rejecting update failed");
    }
}

pub struct TestClient {
    pub client: Arc<Client>,
    pub wire_addr: wire::Address,
    /// Channels opened by accepting incoming proposals.
    pub accepted: mpsc::UnboundedReceiver<Arc<Channel>>,
}

pub fn test_config() -> paychan::client::ClientConfig {
    paychan::client::ClientConfig {
        response_timeout: Duration::from_secs(10),
        funding_timeout: Duration::from_secs(10),
        lock_timeout: Duration::from_secs(10),
    }
}

/// Spawns a client plus its receive loop on the loopback bus.
pub fn spawn_client(
    name: &str,
    rng: &mut StdRng,
    bus: &Arc<TestBus>,
    adjudicator: Arc<dyn Adjudicator>,
    funder: Arc<dyn Funder>,
) -> TestClient {
    let wire_addr = wire::Address::new(name);
    let mut inbox = bus.register(wire_addr.clone());

    let client = Client::new(
        Signer::new(rng),
        wire_addr.clone(),
        Arc::clone(bus) as Arc<dyn Bus>,
        funder,
        adjudicator,
        test_config(),
    );

    let (tx, accepted) = mpsc::unbounded_channel();
    client.set_proposal_handler(Arc::new(ProposalSink { tx }));
    client.set_update_handler(Arc::new(AcceptAllUpdates));

    let recv_client = Arc::clone(&client);
    tokio::spawn(async move {
        while let Some(env) = inbox.recv().await {
            recv_client.handle_message(env).await;
        }
    });

    TestClient {
        client,
        wire_addr,
        accepted,
    }
}

pub fn asset(chain_id: u64) -> Asset {
    Asset {
        chain_id: U256::from(chain_id),
        holder: paychan::wallet::Address([0xAA; 20]),
    }
}

pub fn balances(rows: &[&[u64]]) -> Balances {
    Balances(
        rows.iter()
            .map(|row| row.iter().map(|b| U256::from(*b)).collect())
            .collect(),
    )
}

pub fn two_party_alloc(assets: Vec<Asset>, bals: &[&[u64]]) -> Allocation {
    Allocation::new(assets, balances(bals))
}

pub fn ledger_proposal(peer: &wire::Address, chain_id: u64, bals: [u64; 2]) -> ChannelProposal {
    ChannelProposal {
        peer: peer.clone(),
        challenge_duration: 60,
        init_allocation: two_party_alloc(vec![asset(chain_id)], &[&bals]),
        app_data: vec![],
        virtual_data: None,
    }
}

pub fn virtual_proposal(
    peer: &wire::Address,
    chain_id: u64,
    bals: [u64; 2],
    parents: [ChannelId; 2],
    index_maps: [Vec<u16>; 2],
) -> ChannelProposal {
    ChannelProposal {
        peer: peer.clone(),
        challenge_duration: 60,
        init_allocation: two_party_alloc(vec![asset(chain_id)], &[&bals]),
        app_data: vec![],
        virtual_data: Some(VirtualChannelData {
            parents: parents.to_vec(),
            index_maps: index_maps.to_vec(),
        }),
    }
}

/// Flattens a one-asset balance matrix into plain numbers for assertions.
pub fn bals_of(state: &State) -> Vec<u64> {
    state.allocation.balances.0[0]
        .iter()
        .map(|b| b.as_u64())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnChainPhase {
    Registered,
    Progressed,
    Concluded,
}

#[derive(Debug, Clone)]
pub struct OnChainChannel {
    pub phase: OnChainPhase,
    pub version: u64,
    pub timeout: u64,
}

struct ChainInner {
    block: u64,
    channels: HashMap<ChannelId, OnChainChannel>,
    event_log: HashMap<ChannelId, Vec<AdjudicatorEvent>>,
    event_subs: HashMap<ChannelId, Vec<mpsc::Sender<AdjudicatorEvent>>>,
    block_subs: Vec<mpsc::Sender<u64>>,
}

/// Single-process chain with an adjudicator contract: registers the
/// highest version, concludes once, and pushes events to subscribers.
pub struct MockChain {
    inner: Mutex<ChainInner>,
    alive: AtomicBool,
    pub conclude_submissions: AtomicUsize,
}

impl MockChain {
    pub fn new() -> Arc<Self> {
        Arc::new(MockChain {
            inner: Mutex::new(ChainInner {
                block: 1,
                channels: HashMap::new(),
                event_log: HashMap::new(),
                event_subs: HashMap::new(),
                block_subs: Vec::new(),
            }),
            alive: AtomicBool::new(true),
            conclude_submissions: AtomicUsize::new(0),
        })
    }

    /// Simulates losing the connection to this chain.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn advance_blocks(&self, n: u64) {
        let mut inner = self.inner.lock().unwrap();
        for _ in 0..n {
            inner.block += 1;
            let block = inner.block;
            inner.block_subs.retain(|tx| tx.try_send(block).is_ok());
        }
    }

    pub fn on_chain(&self, id: ChannelId) -> Option<OnChainChannel> {
        self.inner.lock().unwrap().channels.get(&id).cloned()
    }

    fn check_alive(&self) -> Result<(), ChainError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ChainError::ChainUnreachable)
        }
    }

    fn emit(inner: &mut ChainInner, event: AdjudicatorEvent) {
        let id = event.channel_id();
        inner.event_log.entry(id).or_default().push(event.clone());
        if let Some(subs) = inner.event_subs.get_mut(&id) {
            subs.retain(|tx| tx.try_send(event.clone()).is_ok());
        }
    }

    fn apply_register(
        inner: &mut ChainInner,
        params: &Params,
        state: &State,
    ) -> Result<(), ChainError> {
        let id = state.channel_id;
        match inner.channels.get(&id) {
            Some(entry) if entry.phase == OnChainPhase::Concluded => {
                return Err(ChainError::TxFailed("channel already concluded".into()))
            }
            Some(entry) if entry.version >= state.version => {
                return Err(ChainError::TxFailed("stale registration".into()))
            }
            _ => {}
        }
        let timeout = inner.block + params.challenge_duration;
        inner.channels.insert(
            id,
            OnChainChannel {
                phase: OnChainPhase::Registered,
                version: state.version,
                timeout,
            },
        );
        Self::emit(
            inner,
            AdjudicatorEvent::Registered {
                channel_id: id,
                version: state.version,
                timeout,
            },
        );
        Ok(())
    }

    fn apply_conclude(
        inner: &mut ChainInner,
        id: ChannelId,
        version: u64,
    ) -> Result<(), ChainError> {
        if let Some(entry) = inner.channels.get(&id) {
            if entry.phase == OnChainPhase::Concluded {
                return Err(ChainError::TxFailed("channel already concluded".into()));
            }
        }
        let timeout = inner.block;
        inner.channels.insert(
            id,
            OnChainChannel {
                phase: OnChainPhase::Concluded,
                version,
                timeout,
            },
        );
        Self::emit(
            inner,
            AdjudicatorEvent::Concluded {
                channel_id: id,
                version,
                timeout,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ChainBackend for MockChain {
    fn tx_finality_depth(&self) -> u64 {
        1
    }

    async fn submit(&self, call: AdjudicatorCall) -> Result<TxHash, ChainError> {
        self.check_alive()?;
        let mut inner = self.inner.lock().unwrap();
        match call {
            AdjudicatorCall::Register {
                channel,
                sub_channels,
            } => {
                Self::apply_register(&mut inner, &channel.params, &channel.state)?;
                for sub in &sub_channels {
                    Self::apply_register(&mut inner, &sub.params, &sub.state)?;
                }
            }
            AdjudicatorCall::Progress {
                new_state,
                actor_idx,
                ..
            } => {
                let id = new_state.channel_id;
                let timeout = inner.block;
                inner.channels.insert(
                    id,
                    OnChainChannel {
                        phase: OnChainPhase::Progressed,
                        version: new_state.version,
                        timeout,
                    },
                );
                Self::emit(
                    &mut inner,
                    AdjudicatorEvent::Progressed {
                        channel_id: id,
                        version: new_state.version,
                        timeout,
                        state: new_state,
                        actor_idx,
                    },
                );
            }
            AdjudicatorCall::Conclude { state, .. } => {
                self.conclude_submissions.fetch_add(1, Ordering::SeqCst);
                Self::apply_conclude(&mut inner, state.channel_id, state.version)?;
            }
            AdjudicatorCall::ConcludeFinal { state, .. } => {
                self.conclude_submissions.fetch_add(1, Ordering::SeqCst);
                Self::apply_conclude(&mut inner, state.channel_id, state.version)?;
            }
        }
        Ok(rand::random())
    }

    async fn confirm(&self, _: TxHash) -> Result<(), ChainError> {
        self.check_alive()
    }

    async fn past_events(&self, channel_id: ChannelId) -> Result<Vec<AdjudicatorEvent>, ChainError> {
        self.check_alive()?;
        Ok(self
            .inner
            .lock()
            .unwrap()
            .event_log
            .get(&channel_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn subscribe_events(
        &self,
        channel_id: ChannelId,
    ) -> Result<mpsc::Receiver<AdjudicatorEvent>, ChainError> {
        self.check_alive()?;
        let (tx, rx) = mpsc::channel(32);
        self.inner
            .lock()
            .unwrap()
            .event_subs
            .entry(channel_id)
            .or_default()
            .push(tx);
        Ok(rx)
    }

    async fn subscribe_blocks(&self) -> Result<mpsc::Receiver<u64>, ChainError> {
        self.check_alive()?;
        let (tx, rx) = mpsc::channel(32);
        self.inner.lock().unwrap().block_subs.push(tx);
        Ok(rx)
    }
}
