//! Wire-level identities, the message set, and the transport abstraction.
//!
//! Transport and framing are injected: the engine hands fully-formed
//! [Envelope]s to a [Bus] and expects inbound envelopes to be fed into
//! [crate::Client::handle_message]. How bytes move is not its concern.

mod address;
mod encoder;
mod messages;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use address::{Address, PublicKey};
pub use encoder::{encoder, set_encoder, BinEncoder, Encoder};
pub use messages::{
    Message, MsgProposal, MsgProposalAcc, MsgProposalRej, MsgUpdate, MsgUpdateAcc, MsgUpdateRej,
    VirtualFundingProposal, VirtualSettlementProposal,
};

/// The wire identities of all channel participants, ordered by participant
/// index.
pub type Peers = Vec<Address>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("recipient unknown: {0:?}")]
    UnknownRecipient(Address),
    #[error("bus closed")]
    Closed,
}

/// An addressed wire message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub sender: Address,
    pub recipient: Address,
    pub msg: Message,
}

/// Outbound half of the injected transport.
#[async_trait]
pub trait Bus: Send + Sync + 'static {
    async fn publish(&self, env: Envelope) -> Result<(), BusError>;
}
