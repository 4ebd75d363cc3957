use serde::{Deserialize, Serialize};

use super::ChannelId;
use crate::{binenc, wallet::Address, U256};

/// Immutable channel parameters, fixed at proposal time and sent on-chain
/// during a dispute. Their hash is the channel ID.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Params {
    pub challenge_duration: u64,
    pub nonce: U256,
    pub participants: Vec<Address>,
    /// Application identifier; empty for plain payment channels.
    pub app: Vec<u8>,
    pub ledger_channel: bool,
    pub virtual_channel: bool,
}

impl Params {
    /// The content address of the channel described by these parameters.
    ///
    /// `params.id() == state.channel_id` is a structural invariant of every
    /// valid state.
    pub fn id(&self) -> ChannelId {
        binenc::to_hash(self).expect("params encoding cannot fail")
    }

    pub fn num_parts(&self) -> usize {
        self.participants.len()
    }
}
