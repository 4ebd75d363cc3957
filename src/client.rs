//! The channel client: registry, message dispatch, and the protocol
//! drivers layered on the per-channel state machine.

mod adjudicate;
mod channel;
mod proposal;
mod state_watcher;
mod update;
mod virtual_channels;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::adjudicator::{Adjudicator, ChainError};
use crate::channel::{AllocationError, ChannelId, MachineError};
use crate::funder::{Funder, FundingError};
use crate::wallet::{self, Signer};
use crate::wire::{self, Bus, BusError, Envelope, Message};
use crate::Hash;

pub use adjudicate::AdjudicatorEventHandler;
pub use channel::Channel;
pub use proposal::{ChannelProposal, ProposalHandler, ProposalResponder, VirtualChannelData};
pub use update::{ChannelUpdate, UpdateHandler, UpdateResponder};

use state_watcher::Watcher;
use virtual_channels::{FundingEntry, SettlementEntry};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("channel not found: {0:?}")]
    ChannelNotFound(ChannelId),
    #[error("channel closed")]
    ChannelClosed,
    #[error("peer rejected: {0}")]
    PeerRejected(String),
    #[error("peer did not respond in time")]
    RequestTimedOut,
    #[error("machine lock not acquired in time")]
    LockTimeout,
    #[error("invalid proposal: {0}")]
    InvalidProposal(&'static str),
    /// A signature has been sent but the update could not be completed.
    /// The channel can only be resolved through dispute from here.
    #[error("channel out of sync after sent signature: {0}")]
    OutOfSync(MachineError),
    /// The chain reported a registered version ahead of our local state;
    /// either an update was lost locally or a peer state never arrived.
    #[error("registered event version {event} ahead of local version {local}")]
    EventAheadOfLocal { local: u64, event: u64 },
    #[error(transparent)]
    Machine(#[from] MachineError),
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Funding(#[from] FundingError),
    #[error(transparent)]
    Encoding(#[from] crate::binenc::Error),
    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a peer may take to answer a proposal or update.
    pub response_timeout: Duration,
    /// How long funding may take, including the wait for a matching
    /// virtual-channel counterpart proposal.
    pub funding_timeout: Duration,
    /// Bound on acquiring a per-channel machine mutex.
    pub lock_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            response_timeout: Duration::from_secs(10),
            funding_timeout: Duration::from_secs(10),
            lock_timeout: Duration::from_secs(10),
        }
    }
}

pub(crate) enum ProposalResponse {
    Acc(wire::MsgProposalAcc),
    Rej(wire::MsgProposalRej),
}

/// One client per protocol participant. Owns the channel registry and all
/// injected capabilities.
pub struct Client {
    pub(crate) signer: Signer,
    pub(crate) wire_addr: wire::Address,
    pub(crate) bus: Arc<dyn Bus>,
    pub(crate) funder: Arc<dyn Funder>,
    pub(crate) adjudicator: Arc<dyn Adjudicator>,
    pub(crate) cfg: ClientConfig,

    /// Insert-once-remove-once map of all live channels.
    channels: StdRwLock<HashMap<ChannelId, Arc<Channel>>>,

    proposal_handler: StdRwLock<Option<Arc<dyn ProposalHandler>>>,
    update_handler: StdRwLock<Option<Arc<dyn UpdateHandler>>>,

    proposal_slots: StdMutex<HashMap<Hash, oneshot::Sender<ProposalResponse>>>,
    /// Initial-state signatures that arrived before their channel was set
    /// up locally.
    pending_init_sigs: StdMutex<HashMap<ChannelId, Vec<wire::MsgUpdateAcc>>>,

    pub(crate) funding_matcher: Watcher<FundingEntry>,
    pub(crate) settlement_matcher: Watcher<SettlementEntry>,
}

impl Client {
    pub fn new(
        signer: Signer,
        wire_addr: wire::Address,
        bus: Arc<dyn Bus>,
        funder: Arc<dyn Funder>,
        adjudicator: Arc<dyn Adjudicator>,
        cfg: ClientConfig,
    ) -> Arc<Self> {
        Arc::new(Client {
            signer,
            wire_addr,
            bus,
            funder,
            adjudicator,
            cfg,
            channels: StdRwLock::new(HashMap::new()),
            proposal_handler: StdRwLock::new(None),
            update_handler: StdRwLock::new(None),
            proposal_slots: StdMutex::new(HashMap::new()),
            pending_init_sigs: StdMutex::new(HashMap::new()),
            funding_matcher: Watcher::new(virtual_channels::funding_proposals_match),
            settlement_matcher: Watcher::new(virtual_channels::settlement_proposals_match),
        })
    }

    /// Our channel signing address.
    pub fn address(&self) -> wallet::Address {
        self.signer.address()
    }

    pub fn wire_address(&self) -> &wire::Address {
        &self.wire_addr
    }

    pub fn set_proposal_handler(&self, handler: Arc<dyn ProposalHandler>) {
        *self.proposal_handler.write().unwrap() = Some(handler);
    }

    pub fn set_update_handler(&self, handler: Arc<dyn UpdateHandler>) {
        *self.update_handler.write().unwrap() = Some(handler);
    }

    pub fn channel(&self, id: ChannelId) -> Result<Arc<Channel>, Error> {
        self.channels
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::ChannelNotFound(id))
    }

    pub(crate) async fn insert_channel(&self, channel: Arc<Channel>) -> Result<(), Error> {
        use std::collections::hash_map::Entry;
        let id = channel.id();
        match self.channels.write().unwrap().entry(id) {
            Entry::Occupied(_) => return Err(Error::InvalidProposal("channel already exists")),
            Entry::Vacant(slot) => slot.insert(Arc::clone(&channel)),
        };
        // Route any initial-state signatures that raced ahead of us.
        let pending = self.pending_init_sigs.lock().unwrap().remove(&id);
        if let Some(msgs) = pending {
            for msg in msgs {
                channel.route_init_sig(msg).await;
            }
        }
        Ok(())
    }

    pub(crate) fn remove_channel(&self, id: ChannelId) {
        self.channels.write().unwrap().remove(&id);
    }

    /// Entry point for the injected transport: feed every inbound envelope
    /// addressed to this client in here.
    ///
    /// Responses are routed inline; requests that invoke handlers or block
    /// on a matching counterpart run on their own task, so a transport may
    /// call this from a single receive loop.
    pub async fn handle_message(self: &Arc<Self>, env: Envelope) {
        let sender = env.sender;
        match env.msg {
            Message::Proposal(prop) => {
                let client = Arc::clone(self);
                tokio::spawn(async move { client.handle_proposal_msg(sender, prop).await });
            }
            Message::ProposalAcc(acc) => {
                self.route_proposal_response(acc.proposal_id, ProposalResponse::Acc(acc));
            }
            Message::ProposalRej(rej) => {
                self.route_proposal_response(rej.proposal_id, ProposalResponse::Rej(rej));
            }
            Message::Update(msg) => match self.channel_for_peer(&sender, msg.channel_id) {
                Some(channel) => {
                    let handler = self.update_handler();
                    tokio::spawn(async move { channel.handle_update_req(msg, handler).await });
                }
                None => warn!(id = ?msg.channel_id, "update for unknown channel"),
            },
            Message::UpdateAcc(msg) => match self.channel_for_peer(&sender, msg.channel_id) {
                Some(channel) => channel.route_update_acc(msg).await,
                None => self.cache_init_sig(msg),
            },
            Message::UpdateRej(msg) => match self.channel_for_peer(&sender, msg.channel_id) {
                Some(channel) => channel.route_update_rej(msg),
                None => debug!(id = ?msg.channel_id, "reject for unknown channel"),
            },
            Message::VirtualFunding(prop) => {
                match self.channel_for_peer(&sender, prop.update.channel_id) {
                    Some(parent) => {
                        let client = Arc::clone(self);
                        tokio::spawn(
                            async move { client.handle_virtual_funding(parent, prop).await },
                        );
                    }
                    None => warn!("virtual funding proposal for unknown parent"),
                }
            }
            Message::VirtualSettlement(prop) => {
                match self.channel_for_peer(&sender, prop.update.channel_id) {
                    Some(parent) => {
                        let client = Arc::clone(self);
                        tokio::spawn(
                            async move { client.handle_virtual_settlement(parent, prop).await },
                        );
                    }
                    None => warn!("virtual settlement proposal for unknown parent"),
                }
            }
        }
    }

    /// Looks up the channel and checks the sender is its peer; messages
    /// from anyone else are dropped.
    fn channel_for_peer(&self, sender: &wire::Address, id: ChannelId) -> Option<Arc<Channel>> {
        let channel = self.channel(id).ok()?;
        if channel.peer_wire_addr() != sender {
            warn!(id = ?id, peer = ?sender, "message from non-participant dropped");
            return None;
        }
        Some(channel)
    }

    fn update_handler(&self) -> Option<Arc<dyn UpdateHandler>> {
        self.update_handler.read().unwrap().clone()
    }

    pub(crate) fn take_proposal_handler(&self) -> Option<Arc<dyn ProposalHandler>> {
        self.proposal_handler.read().unwrap().clone()
    }

    pub(crate) fn register_proposal_slot(
        &self,
        id: Hash,
    ) -> oneshot::Receiver<ProposalResponse> {
        let (tx, rx) = oneshot::channel();
        self.proposal_slots.lock().unwrap().insert(id, tx);
        rx
    }

    pub(crate) fn drop_proposal_slot(&self, id: Hash) {
        self.proposal_slots.lock().unwrap().remove(&id);
    }

    fn route_proposal_response(&self, id: Hash, response: ProposalResponse) {
        let slot = self.proposal_slots.lock().unwrap().remove(&id);
        match slot {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(id = ?id, "response for unknown proposal dropped"),
        }
    }

    fn cache_init_sig(&self, msg: wire::MsgUpdateAcc) {
        if msg.version != 0 {
            debug!(id = ?msg.channel_id, "accept for unknown channel dropped");
            return;
        }
        self.pending_init_sigs
            .lock()
            .unwrap()
            .entry(msg.channel_id)
            .or_default()
            .push(msg);
    }
}
