//! On-chain arbitration.
//!
//! The engine never talks to a blockchain directly. A [ChainBackend] is the
//! injected per-chain capability (submit and confirm transactions, scan and
//! subscribe to events); [MultiAdjudicator] mediates across one backend per
//! chain and implements the conclude discipline on top of them.

mod mediator;
mod subscription;

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channel::{ChannelId, Params, PartIdx, SignedState, State};
use crate::wallet::Signature;
use crate::{Hash, U256};

pub use mediator::MultiAdjudicator;
pub use subscription::EventSub;

pub type ChainId = U256;
pub type TxHash = Hash;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxType {
    Register,
    Progress,
    Conclude,
    ConcludeFinal,
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("chain not reachable")]
    ChainUnreachable,
    #[error("transaction {tx_type:?} timed out in mempool: {hash:?}")]
    TxTimedOut { tx_type: TxType, hash: TxHash },
    /// The transaction was mined but reverted.
    #[error("transaction failed: {0}")]
    TxFailed(String),
    #[error("invalid contract code")]
    InvalidContractCode,
    #[error("no backend registered for chain {0}")]
    NoBackendForChain(ChainId),
    #[error("event subscription closed")]
    SubscriptionClosed,
    #[error("missing sub-state for channel {0:?}")]
    MissingSubState(ChannelId),
}

/// An adjudicator contract event, already collapsed to the data the
/// off-chain engine acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum AdjudicatorEvent {
    Registered {
        channel_id: ChannelId,
        version: u64,
        /// Challenge timeout, as a block number.
        timeout: u64,
    },
    Progressed {
        channel_id: ChannelId,
        version: u64,
        timeout: u64,
        state: State,
        actor_idx: PartIdx,
    },
    Concluded {
        channel_id: ChannelId,
        version: u64,
        timeout: u64,
    },
}

impl AdjudicatorEvent {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            AdjudicatorEvent::Registered { channel_id, .. }
            | AdjudicatorEvent::Progressed { channel_id, .. }
            | AdjudicatorEvent::Concluded { channel_id, .. } => *channel_id,
        }
    }

    pub fn version(&self) -> u64 {
        match self {
            AdjudicatorEvent::Registered { version, .. }
            | AdjudicatorEvent::Progressed { version, .. }
            | AdjudicatorEvent::Concluded { version, .. } => *version,
        }
    }

    pub fn timeout(&self) -> u64 {
        match self {
            AdjudicatorEvent::Registered { timeout, .. }
            | AdjudicatorEvent::Progressed { timeout, .. }
            | AdjudicatorEvent::Concluded { timeout, .. } => *timeout,
        }
    }
}

/// Everything needed to act on-chain for one channel.
#[derive(Debug, Clone)]
pub struct AdjudicatorReq {
    pub params: Params,
    pub idx: PartIdx,
    pub tx: SignedState,
    /// Whether we are the secondary party of a final state and should give
    /// the initiator a head start before concluding ourselves.
    pub secondary: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressReq {
    pub base: AdjudicatorReq,
    pub new_state: State,
    pub sig: Signature,
}

/// Latest known states of sub-channels, keyed by channel ID.
pub type StateMap = HashMap<ChannelId, State>;

/// The adjudicator capability as seen by the client and watcher.
#[async_trait]
pub trait Adjudicator: Send + Sync + 'static {
    /// Registers the channel and all sub-channels of `sub_channels` on
    /// every backend referenced by their assets.
    async fn register(
        &self,
        req: AdjudicatorReq,
        sub_channels: &[SignedState],
    ) -> Result<(), ChainError>;

    /// Posts a forced state progression.
    async fn progress(&self, req: ProgressReq) -> Result<(), ChainError>;

    /// Ensures the channel is concluded on every backend and withdraws.
    /// Blocks until every backend emitted `Concluded`; bounded by the
    /// caller's cancellation.
    async fn withdraw(&self, req: AdjudicatorReq, sub_states: StateMap) -> Result<(), ChainError>;

    /// A merged event stream over all backends. Per backend, at most one
    /// event is queued at any time: newer versions (or same version with a
    /// later timeout) replace queued events.
    async fn subscribe(&self, channel_id: ChannelId) -> Result<EventSub, ChainError>;
}

/// A transaction payload for the adjudicator contract of one chain.
#[derive(Debug, Clone)]
pub enum AdjudicatorCall {
    Register {
        channel: SignedState,
        sub_channels: Vec<SignedState>,
    },
    Progress {
        params: Params,
        old_state: State,
        new_state: State,
        actor_idx: PartIdx,
        sig: Signature,
    },
    Conclude {
        params: Params,
        state: State,
        /// Depth-first flattening of the sub-channel tree.
        sub_states: Vec<State>,
    },
    ConcludeFinal {
        params: Params,
        state: State,
        sigs: Vec<Signature>,
    },
}

impl AdjudicatorCall {
    pub fn tx_type(&self) -> TxType {
        match self {
            AdjudicatorCall::Register { .. } => TxType::Register,
            AdjudicatorCall::Progress { .. } => TxType::Progress,
            AdjudicatorCall::Conclude { .. } => TxType::Conclude,
            AdjudicatorCall::ConcludeFinal { .. } => TxType::ConcludeFinal,
        }
    }
}

/// Injected per-chain contract handle.
///
/// Implementations own the transaction plumbing of one chain; the mediator
/// serializes submissions per backend and interprets the results.
#[async_trait]
pub trait ChainBackend: Send + Sync + 'static {
    /// Number of blocks after which a transaction is considered final.
    fn tx_finality_depth(&self) -> u64;

    /// Submits a transaction. Returns once it is in the mempool.
    async fn submit(&self, call: AdjudicatorCall) -> Result<TxHash, ChainError>;

    /// Waits until the given transaction is mined and final.
    async fn confirm(&self, tx: TxHash) -> Result<(), ChainError>;

    /// All adjudicator events for the channel emitted so far.
    async fn past_events(&self, channel_id: ChannelId) -> Result<Vec<AdjudicatorEvent>, ChainError>;

    /// Future adjudicator events for the channel. The first delivered event
    /// may be a past one.
    async fn subscribe_events(
        &self,
        channel_id: ChannelId,
    ) -> Result<mpsc::Receiver<AdjudicatorEvent>, ChainError>;

    /// New block numbers as they are produced.
    async fn subscribe_blocks(&self) -> Result<mpsc::Receiver<u64>, ChainError>;
}
