use serde::{Deserialize, Serialize};

use super::{Allocation, ChannelId, Params};
use crate::binenc;

/// Complete off-chain state of a channel at one version.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub channel_id: ChannelId,
    pub version: u64,
    pub allocation: Allocation,
    pub app_data: Vec<u8>,
    pub is_final: bool,
}

impl State {
    /// Builds the version-0 state for the given parameters.
    pub fn new(params: &Params, allocation: Allocation, app_data: Vec<u8>) -> Self {
        State {
            channel_id: params.id(),
            version: 0,
            allocation,
            app_data,
            is_final: false,
        }
    }

    /// Clones the state with the version bumped, ready to be mutated into
    /// the next update.
    pub fn make_next(&self) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next
    }

    /// Byte identity under the deterministic encoding. Virtual-channel
    /// proposal matching uses this, not structural equality.
    pub fn encoding_equal(&self, other: &State) -> bool {
        binenc::to_vec(self).ok() == binenc::to_vec(other).ok()
    }
}
