//! The closed set of wire payloads.
//!
//! The responder path dispatches on the tag of [Message]; adding a case is
//! a deliberate protocol change, not an extension point.

use serde::{Deserialize, Serialize};

use crate::channel::{Allocation, ChannelId, Params, PartIdx, State};
use crate::wallet::{self, Signature};
use crate::{Bytes32, Hash};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Message {
    Proposal(MsgProposal),
    ProposalAcc(MsgProposalAcc),
    ProposalRej(MsgProposalRej),
    Update(MsgUpdate),
    UpdateAcc(MsgUpdateAcc),
    UpdateRej(MsgUpdateRej),
    VirtualFunding(VirtualFundingProposal),
    VirtualSettlement(VirtualSettlementProposal),
}

/// Proposal of a new channel. For virtual channels, `parents` and
/// `index_maps` carry one entry per participant; both are empty for ledger
/// channels.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MsgProposal {
    pub proposal_id: Hash,
    pub challenge_duration: u64,
    pub nonce_share: Bytes32,
    /// The proposer's channel signing address.
    pub participant: wallet::Address,
    pub init_allocation: Allocation,
    pub app_data: Vec<u8>,
    pub virtual_channel: bool,
    pub parents: Vec<ChannelId>,
    pub index_maps: Vec<Vec<PartIdx>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MsgProposalAcc {
    pub proposal_id: Hash,
    pub nonce_share: Bytes32,
    /// The responder's channel signing address.
    pub participant: wallet::Address,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MsgProposalRej {
    pub proposal_id: Hash,
    pub reason: String,
}

/// A state update proposal, signed by the actor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MsgUpdate {
    pub channel_id: ChannelId,
    pub state: State,
    pub actor_idx: PartIdx,
    pub sig: Signature,
}

/// Acceptance of the update at `version`, carrying the responder's
/// signature.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MsgUpdateAcc {
    pub channel_id: ChannelId,
    pub version: u64,
    pub sig: Signature,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MsgUpdateRej {
    pub channel_id: ChannelId,
    pub version: u64,
    pub reason: String,
}

/// Parent-channel update whose payload asks the intermediary to lock
/// collateral for a new virtual channel.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VirtualFundingProposal {
    pub update: MsgUpdate,
    pub virtual_params: Params,
    pub initial_state: State,
    /// Ordered by virtual-channel participant index.
    pub initial_sigs: Vec<Signature>,
    /// Maps virtual participant indices to parent indices.
    pub index_map: Vec<PartIdx>,
}

/// Parent-channel update releasing a final virtual channel's collateral
/// back into the parent.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct VirtualSettlementProposal {
    pub update: MsgUpdate,
    pub virtual_params: Params,
    pub final_state: State,
    pub final_sigs: Vec<Signature>,
}

impl Message {
    /// The channel an inbound message must be routed to, if any.
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            Message::Proposal(_) | Message::ProposalAcc(_) | Message::ProposalRej(_) => None,
            Message::Update(m) => Some(m.channel_id),
            Message::UpdateAcc(m) => Some(m.channel_id),
            Message::UpdateRej(m) => Some(m.channel_id),
            Message::VirtualFunding(m) => Some(m.update.channel_id),
            Message::VirtualSettlement(m) => Some(m.update.channel_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Asset, Balances};
    use crate::{from_slice, to_vec, U256};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn test_state(rng: &mut StdRng) -> (Params, State) {
        let params = Params {
            challenge_duration: 60,
            nonce: rng.gen(),
            participants: vec![rng.gen(), rng.gen()],
            app: vec![],
            ledger_channel: true,
            virtual_channel: false,
        };
        let alloc = Allocation::new(
            vec![Asset {
                chain_id: U256::from(1u64),
                holder: rng.gen(),
            }],
            Balances(vec![vec![U256::from(7u64), U256::from(13u64)]]),
        );
        let state = State::new(&params, alloc, vec![]);
        (params, state)
    }

    fn sig(rng: &mut StdRng) -> Signature {
        let mut bytes = [0u8; 65];
        rng.fill(&mut bytes[..]);
        Signature(bytes)
    }

    #[test]
    fn every_message_round_trips() {
        let mut rng = StdRng::seed_from_u64(51);
        let (params, state) = test_state(&mut rng);
        let update = MsgUpdate {
            channel_id: state.channel_id,
            state: state.clone(),
            actor_idx: 0,
            sig: sig(&mut rng),
        };

        let messages = vec![
            Message::Proposal(MsgProposal {
                proposal_id: rng.gen(),
                challenge_duration: 60,
                nonce_share: rng.gen(),
                participant: rng.gen(),
                init_allocation: state.allocation.clone(),
                app_data: vec![1, 2, 3],
                virtual_channel: false,
                parents: vec![],
                index_maps: vec![],
            }),
            Message::ProposalAcc(MsgProposalAcc {
                proposal_id: rng.gen(),
                nonce_share: rng.gen(),
                participant: rng.gen(),
            }),
            Message::ProposalRej(MsgProposalRej {
                proposal_id: rng.gen(),
                reason: "no".into(),
            }),
            Message::Update(update.clone()),
            Message::UpdateAcc(MsgUpdateAcc {
                channel_id: state.channel_id,
                version: 3,
                sig: sig(&mut rng),
            }),
            Message::UpdateRej(MsgUpdateRej {
                channel_id: state.channel_id,
                version: 3,
                reason: "stale".into(),
            }),
            Message::VirtualFunding(VirtualFundingProposal {
                update: update.clone(),
                virtual_params: params.clone(),
                initial_state: state.clone(),
                initial_sigs: vec![sig(&mut rng), sig(&mut rng)],
                index_map: vec![1, 0],
            }),
            Message::VirtualSettlement(VirtualSettlementProposal {
                update,
                virtual_params: params,
                final_state: state,
                final_sigs: vec![sig(&mut rng), sig(&mut rng)],
            }),
        ];

        for msg in messages {
            let bytes = to_vec(&msg).unwrap();
            let back: Message = from_slice(&bytes).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn tags_are_stable() {
        let mut rng = StdRng::seed_from_u64(52);
        let msg = Message::ProposalRej(MsgProposalRej {
            proposal_id: rng.gen(),
            reason: String::new(),
        });
        // The third variant carries tag 2; reordering the union is a
        // protocol change and must show up here.
        assert_eq!(to_vec(&msg).unwrap()[0], 2);
    }
}
