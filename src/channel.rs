//! Channel data model: parameters, allocations, states and the per-channel
//! state machine.

mod allocation;
mod machine;
mod params;
mod state;

use serde::{Deserialize, Serialize};

use crate::{binenc, Hash, U256};

pub use allocation::{transform_balances, Allocation, AllocationError, Balances, SubAlloc};
pub use machine::{MachineError, Phase, SignedState, StateMachine, Transaction};
pub use params::Params;
pub use state::State;

/// Index of a participant in a channel. `0` is the channel proposer.
pub type PartIdx = u16;

/// Content address of a channel: the hash of its immutable parameters.
pub type ChannelId = Hash;

/// Uniquely identifies an asset by blockchain + holder contract.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub struct Asset {
    pub chain_id: U256,
    pub holder: crate::wallet::Address,
}

impl Asset {
    /// Canonical byte form, used as a map key by the multi-asset funder.
    pub fn key(&self) -> Vec<u8> {
        binenc::to_vec(self).expect("asset encoding cannot fail")
    }
}

/// Digest signed by every participant: the deterministic encoding of the
/// parameters followed by the state. Byte-identical on every peer.
pub fn state_hash(params: &Params, state: &State) -> Result<Hash, binenc::Error> {
    binenc::to_hash(&(params, state))
}
