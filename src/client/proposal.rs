//! Channel establishment: proposal handshake, initial-state signing, and
//! funding.

use std::sync::Arc;

use async_trait::async_trait;
use sha3::{Digest, Keccak256};
use tracing::warn;

use super::{Channel, Client, Error, ProposalResponse};
use crate::channel::{Allocation, ChannelId, Params, PartIdx};
use crate::funder::FundingReq;
use crate::wire::{self, Envelope, Message, MsgProposal, MsgProposalAcc, MsgProposalRej, MsgUpdateAcc};
use crate::{Bytes32, Hash, U256};

/// Virtual-channel specifics of a proposal: the parent channel and index
/// map of each participant, ordered by participant index.
#[derive(Debug, Clone)]
pub struct VirtualChannelData {
    pub parents: Vec<ChannelId>,
    pub index_maps: Vec<Vec<PartIdx>>,
}

/// User-facing configuration for opening a channel with one peer.
#[derive(Debug, Clone)]
pub struct ChannelProposal {
    pub peer: wire::Address,
    pub challenge_duration: u64,
    /// Initial funds; column 0 is the proposer.
    pub init_allocation: Allocation,
    pub app_data: Vec<u8>,
    pub virtual_data: Option<VirtualChannelData>,
}

/// Decides how to handle incoming channel proposals.
#[async_trait]
pub trait ProposalHandler: Send + Sync + 'static {
    async fn handle_proposal(&self, proposal: MsgProposal, responder: ProposalResponder);
}

/// Single-use answer to an incoming channel proposal.
pub struct ProposalResponder {
    client: Arc<Client>,
    sender: wire::Address,
    prop: MsgProposal,
}

impl ProposalResponder {
    /// Accepts the proposal: signs the initial state, waits for the
    /// proposer's signature, funds, and returns the open channel.
    pub async fn accept(self) -> Result<Arc<Channel>, Error> {
        self.client.accept_proposal(self.sender, self.prop).await
    }

    pub async fn reject(self, reason: &str) -> Result<(), Error> {
        self.client
            .bus
            .publish(Envelope {
                sender: self.client.wire_addr.clone(),
                recipient: self.sender,
                msg: Message::ProposalRej(MsgProposalRej {
                    proposal_id: self.prop.proposal_id,
                    reason: reason.to_owned(),
                }),
            })
            .await?;
        Ok(())
    }
}

/// Both participants contribute a nonce share; the channel nonce is the
/// hash of both, so neither side controls the channel ID alone.
fn combine_nonce_shares(a: Bytes32, b: Bytes32) -> U256 {
    let mut hasher = Keccak256::new();
    hasher.update(a.0);
    hasher.update(b.0);
    let hash: [u8; 32] = hasher.finalize().into();
    U256::from_big_endian(&hash)
}

fn make_params(
    prop: &MsgProposal,
    participants: Vec<crate::wallet::Address>,
    nonce: U256,
) -> Params {
    Params {
        challenge_duration: prop.challenge_duration,
        nonce,
        participants,
        app: vec![],
        ledger_channel: !prop.virtual_channel,
        virtual_channel: prop.virtual_channel,
    }
}

fn check_proposal(prop: &ChannelProposal) -> Result<(), Error> {
    if prop.challenge_duration == 0 {
        return Err(Error::InvalidProposal("challenge duration not set"));
    }
    prop.init_allocation.validate()?;
    if !prop.init_allocation.locked.is_empty() {
        return Err(Error::InvalidProposal("initial allocation cannot lock funds"));
    }
    if prop.init_allocation.balances.num_parts() != 2 {
        return Err(Error::InvalidProposal("only two-party channels supported"));
    }
    if let Some(virt) = &prop.virtual_data {
        if virt.parents.len() != 2 || virt.index_maps.len() != 2 {
            return Err(Error::InvalidProposal("virtual data must cover both sides"));
        }
    }
    Ok(())
}

impl Client {
    /// Proposes a new channel to `prop.peer` and drives it all the way to
    /// `Acting`: handshake, initial-state signing, funding.
    pub async fn propose_channel(
        self: &Arc<Self>,
        prop: ChannelProposal,
    ) -> Result<Arc<Channel>, Error> {
        check_proposal(&prop)?;

        let proposal_id: Hash = rand::random();
        let nonce_share: Bytes32 = rand::random();
        let (parents, index_maps) = match &prop.virtual_data {
            Some(virt) => (virt.parents.clone(), virt.index_maps.clone()),
            None => (vec![], vec![]),
        };
        let msg = MsgProposal {
            proposal_id,
            challenge_duration: prop.challenge_duration,
            nonce_share,
            participant: self.address(),
            init_allocation: prop.init_allocation.clone(),
            app_data: prop.app_data.clone(),
            virtual_channel: prop.virtual_data.is_some(),
            parents,
            index_maps,
        };

        let rx = self.register_proposal_slot(proposal_id);
        self.bus
            .publish(Envelope {
                sender: self.wire_addr.clone(),
                recipient: prop.peer.clone(),
                msg: Message::Proposal(msg.clone()),
            })
            .await?;

        let response = tokio::time::timeout(self.cfg.response_timeout, rx)
            .await
            .map_err(|_| {
                self.drop_proposal_slot(proposal_id);
                Error::RequestTimedOut
            })?
            .map_err(|_| Error::ChannelClosed)?;

        let acc = match response {
            ProposalResponse::Rej(rej) => return Err(Error::PeerRejected(rej.reason)),
            ProposalResponse::Acc(acc) => acc,
        };

        let nonce = combine_nonce_shares(msg.nonce_share, acc.nonce_share);
        let params = make_params(&msg, vec![self.address(), acc.participant], nonce);
        self.setup_channel(params, 0, vec![self.wire_addr.clone(), prop.peer], &msg)
            .await
    }

    pub(crate) async fn handle_proposal_msg(self: &Arc<Self>, sender: wire::Address, prop: MsgProposal) {
        if prop.challenge_duration == 0 || prop.init_allocation.validate().is_err() {
            warn!(id = ?prop.proposal_id, "malformed channel proposal dropped");
            return;
        }
        let handler = match self.take_proposal_handler() {
            Some(handler) => handler,
            None => {
                warn!("no proposal handler registered, dropping proposal");
                return;
            }
        };
        let responder = ProposalResponder {
            client: Arc::clone(self),
            sender,
            prop: prop.clone(),
        };
        handler.handle_proposal(prop, responder).await;
    }

    pub(crate) async fn accept_proposal(
        self: &Arc<Self>,
        sender: wire::Address,
        prop: MsgProposal,
    ) -> Result<Arc<Channel>, Error> {
        let nonce_share: Bytes32 = rand::random();

        self.bus
            .publish(Envelope {
                sender: self.wire_addr.clone(),
                recipient: sender.clone(),
                msg: Message::ProposalAcc(MsgProposalAcc {
                    proposal_id: prop.proposal_id,
                    nonce_share,
                    participant: self.address(),
                }),
            })
            .await?;

        let nonce = combine_nonce_shares(prop.nonce_share, nonce_share);
        let params = make_params(&prop, vec![prop.participant, self.address()], nonce);
        self.setup_channel(params, 1, vec![sender, self.wire_addr.clone()], &prop)
            .await
    }

    /// Shared tail of both handshake sides: create the channel, exchange
    /// initial-state signatures, fund, enter `Acting`.
    async fn setup_channel(
        self: &Arc<Self>,
        params: Params,
        idx: PartIdx,
        peers: wire::Peers,
        prop: &MsgProposal,
    ) -> Result<Arc<Channel>, Error> {
        let (parent, index_map) = if prop.virtual_channel {
            let parent = self.channel(prop.parents[idx as usize])?;
            (Some(parent), Some(prop.index_maps[idx as usize].clone()))
        } else {
            (None, None)
        };

        let channel = Channel::new(self, params, idx, peers, parent, index_map, false)?;

        let sig = {
            let mut mach = channel.mach.lock().await;
            mach.init(prop.init_allocation.clone(), prop.app_data.clone())?;
            mach.sign(&self.signer)?
        };

        // Insert before sending: the peer's initial signature may already
        // be waiting in the early-arrival cache.
        self.insert_channel(Arc::clone(&channel)).await?;

        let result = async {
            channel
                .send_to_peer(Message::UpdateAcc(MsgUpdateAcc {
                    channel_id: channel.id(),
                    version: 0,
                    sig,
                }))
                .await?;
            channel.await_init_complete(self.cfg.funding_timeout).await?;

            if channel.is_virtual_channel() {
                self.fund_virtual(&channel).await?;
            } else {
                let (params, state) = {
                    let mach = channel.mach.lock().await;
                    (mach.params().clone(), mach.state()?.clone())
                };
                self.funder.fund(FundingReq { params, state, idx }).await?;
            }

            let mut mach = channel.mach.lock().await;
            mach.set_funded()?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            self.remove_channel(channel.id());
            return Err(err);
        }
        Ok(channel)
    }
}
