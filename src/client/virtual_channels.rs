//! The virtual-channel funding and settlement sub-protocol.
//!
//! A virtual channel between two peers is funded by locking equivalent
//! collateral in two parent channels, one per peer, both shared with the
//! intermediary. Each peer proposes a coordinated parent update; the
//! intermediary validates both, blocks until they match, and only then
//! accepts both. Settlement runs the same discipline in reverse.

use std::sync::Arc;

use tracing::{error, warn};

use super::update::UpdateResponder;
use super::{Channel, Client, Error};
use crate::channel::{
    state_hash, transform_balances, AllocationError, PartIdx, State, SubAlloc,
};
use crate::wallet;
use crate::wire::{Message, MsgUpdate, VirtualFundingProposal, VirtualSettlementProposal};
use crate::Hash;

/// A funding proposal queued at the intermediary, waiting for its
/// counterpart over the other parent.
pub(crate) struct FundingEntry {
    pub prop: VirtualFundingProposal,
    /// The proposing peer's index in the parent channel it came over.
    pub proposer_parent_idx: PartIdx,
    pub parent_id: Hash,
}

pub(crate) struct SettlementEntry {
    pub prop: VirtualSettlementProposal,
    pub parent_id: Hash,
}

/// Two funding proposals match iff they reference the same virtual
/// channel, their initial states are byte-identical, and their index maps
/// together place every virtual participant at its proposer's position.
/// Matching on byte-equal states (not just the channel ID) is what rules
/// out mismatched balances.
pub(crate) fn funding_proposals_match(a: &FundingEntry, b: &FundingEntry) -> bool {
    if a.parent_id == b.parent_id {
        return false;
    }
    if a.prop.initial_state.channel_id != b.prop.initial_state.channel_id {
        return false;
    }
    if !a.prop.initial_state.encoding_equal(&b.prop.initial_state) {
        return false;
    }

    let num_parts = a.prop.virtual_params.num_parts();
    let mut covered = vec![false; num_parts];
    for entry in [a, b] {
        for (child_idx, parent_idx) in entry.prop.index_map.iter().enumerate() {
            if *parent_idx == entry.proposer_parent_idx {
                covered[child_idx] = true;
            }
        }
    }
    covered.into_iter().all(|c| c)
}

pub(crate) fn settlement_proposals_match(a: &SettlementEntry, b: &SettlementEntry) -> bool {
    a.parent_id != b.parent_id
        && a.prop.final_state.channel_id == b.prop.final_state.channel_id
        && a.prop.final_state.encoding_equal(&b.prop.final_state)
}

impl Client {
    /// Peer side: funds the freshly-signed virtual channel by proposing
    /// the collateral lock in our parent channel. Returns once the
    /// intermediary accepted, i.e. once both sides' proposals matched.
    pub(crate) async fn fund_virtual(self: &Arc<Self>, channel: &Arc<Channel>) -> Result<(), Error> {
        let parent = channel
            .parent()
            .ok_or(Error::InvalidProposal("virtual channel has no parent"))?;
        let index_map = channel
            .index_map()
            .ok_or(Error::InvalidProposal("virtual channel has no index map"))?
            .clone();
        parent.propose_virtual_funding(channel, index_map).await
    }

    /// Intermediary side: validate, wait for the matching counterpart,
    /// then accept. A validation failure or missing counterpart rejects
    /// the parent update.
    pub(crate) async fn handle_virtual_funding(
        self: &Arc<Self>,
        parent: Arc<Channel>,
        prop: VirtualFundingProposal,
    ) {
        let pidx = parent.peer_idx();
        let responder =
            UpdateResponder::new(Arc::clone(&parent), pidx, prop.update.clone(), true);

        let current = match parent.state().await {
            Ok(state) => state,
            Err(err) => {
                warn!(id = ?parent.id(), %err, "parent state unavailable");
                return;
            }
        };
        if let Err(reason) = validate_virtual_funding(&current, &prop) {
            warn!(id = ?prop.update.channel_id, reason, "rejecting virtual funding proposal");
            if let Err(err) = responder.reject(reason).await {
                warn!(%err, "sending funding rejection failed");
            }
            return;
        }

        let entry = FundingEntry {
            prop: prop.clone(),
            proposer_parent_idx: pidx,
            parent_id: parent.id(),
        };
        let timeout = self.cfg.funding_timeout;
        match self.funding_matcher.await_match(entry, timeout).await {
            Err(_) => {
                let reason = "no matching funding proposal";
                warn!(id = ?prop.virtual_params.id(), reason);
                if let Err(err) = responder.reject(reason).await {
                    warn!(%err, "sending funding rejection failed");
                }
            }
            Ok(_counterpart) => {
                // Keep a copy of the virtual channel so a later dispute can
                // be refuted with its freshest state. Both released
                // handlers race here; the registry keeps the first.
                if let Err(err) = self.persist_virtual_channel(&prop).await {
                    warn!(id = ?prop.virtual_params.id(), %err, "persisting virtual channel failed");
                }
                if let Err(err) = responder.accept().await {
                    error!(id = ?parent.id(), %err, "accepting virtual funding failed");
                }
            }
        }
    }

    /// Stores a watch-only copy of the virtual channel, held by a
    /// synthetic account on behalf of the intermediary. It never signs.
    async fn persist_virtual_channel(
        self: &Arc<Self>,
        prop: &VirtualFundingProposal,
    ) -> Result<(), Error> {
        let id = prop.virtual_params.id();
        if self.channel(id).is_ok() {
            return Ok(());
        }

        let peers = vec![self.wire_addr.clone(); prop.virtual_params.num_parts()];
        let channel = Channel::new(
            self,
            prop.virtual_params.clone(),
            0,
            peers,
            None,
            None,
            true,
        )?;
        {
            let mut mach = channel.mach.lock().await;
            mach.init(
                prop.initial_state.allocation.clone(),
                prop.initial_state.app_data.clone(),
            )?;
            for (i, sig) in prop.initial_sigs.iter().enumerate() {
                mach.add_sig(i as PartIdx, *sig)?;
            }
            mach.enable_init()?;
            mach.set_funded()?;
        }
        self.insert_channel(channel).await
    }

    /// Intermediary side of settlement; mirrors the funding discipline.
    pub(crate) async fn handle_virtual_settlement(
        self: &Arc<Self>,
        parent: Arc<Channel>,
        prop: VirtualSettlementProposal,
    ) {
        let pidx = parent.peer_idx();
        let responder =
            UpdateResponder::new(Arc::clone(&parent), pidx, prop.update.clone(), true);

        let current = match parent.state().await {
            Ok(state) => state,
            Err(err) => {
                warn!(id = ?parent.id(), %err, "parent state unavailable");
                return;
            }
        };
        if let Err(reason) = validate_virtual_settlement(&current, &prop) {
            warn!(id = ?prop.update.channel_id, reason, "rejecting virtual settlement proposal");
            if let Err(err) = responder.reject(reason).await {
                warn!(%err, "sending settlement rejection failed");
            }
            return;
        }

        let entry = SettlementEntry {
            prop: prop.clone(),
            parent_id: parent.id(),
        };
        let timeout = self.cfg.funding_timeout;
        match self.settlement_matcher.await_match(entry, timeout).await {
            Err(_) => {
                let reason = "no matching settlement proposal";
                warn!(id = ?prop.virtual_params.id(), reason);
                if let Err(err) = responder.reject(reason).await {
                    warn!(%err, "sending settlement rejection failed");
                }
            }
            Ok(_counterpart) => {
                if let Err(err) = self.finalize_virtual_copy(&prop).await {
                    warn!(id = ?prop.virtual_params.id(), %err, "finalizing virtual channel copy failed");
                }
                if let Err(err) = responder.accept().await {
                    error!(id = ?parent.id(), %err, "accepting virtual settlement failed");
                }
            }
        }
    }

    /// Adopts the final state into our copy of the virtual channel and
    /// retires it from the registry.
    async fn finalize_virtual_copy(
        self: &Arc<Self>,
        prop: &VirtualSettlementProposal,
    ) -> Result<(), Error> {
        let id = prop.virtual_params.id();
        let channel = match self.channel(id) {
            Ok(channel) => channel,
            // The other released handler has already retired it.
            Err(_) => return Ok(()),
        };
        {
            let mut mach = channel.mach.lock().await;
            mach.adopt_final(prop.final_state.clone(), prop.final_sigs.clone())?;
        }
        self.remove_channel(id);
        Ok(())
    }
}

impl Channel {
    /// Peer side: clone the parent state, move the virtual channel's
    /// initial balances into a fresh sub-allocation, and propose that as a
    /// funding update to the intermediary.
    pub(crate) async fn propose_virtual_funding(
        self: &Arc<Self>,
        virtual_ch: &Arc<Channel>,
        index_map: Vec<PartIdx>,
    ) -> Result<(), Error> {
        let mut mach = self.lock_mach().await?;

        let (virtual_params, virtual_signed) = {
            let vm = virtual_ch.mach.lock().await;
            (vm.params().clone(), vm.signed_state()?)
        };

        let mut next = mach.state()?.make_next();
        let translated = transform_balances(
            &virtual_signed.state.allocation.balances,
            mach.params().num_parts(),
            &index_map,
        );
        next.allocation.balances = next.allocation.balances.checked_sub(&translated)?;
        next.allocation.add_sub_alloc(SubAlloc::new(
            virtual_ch.id(),
            virtual_signed.state.allocation.balances.sum(),
            index_map.clone(),
        ))?;

        let initial_state = virtual_signed.state;
        let initial_sigs = virtual_signed.sigs;
        let wrap = move |update: MsgUpdate| {
            Message::VirtualFunding(VirtualFundingProposal {
                update,
                virtual_params,
                initial_state,
                initial_sigs,
                index_map,
            })
        };
        self.propose_update_locked(&mut mach, next, true, wrap).await
    }

    /// Peer side: release a final virtual channel's collateral back into
    /// this parent via a settlement update to the intermediary.
    pub(crate) async fn withdraw_virtual(
        self: &Arc<Self>,
        virtual_ch: &Arc<Channel>,
    ) -> Result<(), Error> {
        let mut mach = self.lock_mach().await?;

        let (virtual_params, virtual_signed) = {
            let vm = virtual_ch.mach.lock().await;
            (vm.params().clone(), vm.signed_state()?)
        };

        let current = mach.state()?;
        let sub = current
            .allocation
            .sub_alloc(virtual_ch.id())
            .ok_or(AllocationError::NotAllocated(virtual_ch.id()))?
            .clone();
        if !sub.balances_equal(&virtual_signed.state.allocation.balances.sum()) {
            return Err(AllocationError::InvalidAllocation.into());
        }

        let translated = transform_balances(
            &virtual_signed.state.allocation.balances,
            mach.params().num_parts(),
            &sub.index_map,
        );
        let mut next = current.make_next();
        next.allocation.balances = next.allocation.balances.checked_add(&translated)?;
        next.allocation.remove_sub_alloc(virtual_ch.id())?;

        let final_state = virtual_signed.state;
        let final_sigs = virtual_signed.sigs;
        let wrap = move |update: MsgUpdate| {
            Message::VirtualSettlement(VirtualSettlementProposal {
                update,
                virtual_params,
                final_state,
                final_sigs,
            })
        };
        self.propose_update_locked(&mut mach, next, true, wrap).await
    }
}

fn verify_virtual_sigs(
    params: &crate::channel::Params,
    state: &State,
    sigs: &[wallet::Signature],
) -> Result<(), &'static str> {
    if sigs.len() != params.num_parts() {
        return Err("wrong number of signatures");
    }
    let hash = state_hash(params, state).map_err(|_| "state not encodable")?;
    for (i, sig) in sigs.iter().enumerate() {
        if !wallet::verify(hash, params.participants[i], sig) {
            return Err("invalid signature");
        }
    }
    Ok(())
}

fn validate_virtual_funding(
    parent_current: &State,
    prop: &VirtualFundingProposal,
) -> Result<(), &'static str> {
    let virtual_id = prop.virtual_params.id();
    if virtual_id != prop.initial_state.channel_id {
        return Err("state does not match parameters");
    }
    if !prop.virtual_params.virtual_channel {
        return Err("virtual channel flag not set");
    }
    if !prop.initial_state.allocation.locked.is_empty() {
        return Err("cannot have locked funds");
    }
    verify_virtual_sigs(&prop.virtual_params, &prop.initial_state, &prop.initial_sigs)?;
    if prop.virtual_params.num_parts() != prop.index_map.len() {
        return Err("index map: invalid length");
    }

    // Not allocated before, allocated exactly once after.
    if parent_current.allocation.sub_alloc(virtual_id).is_some() {
        return Err("virtual channel already allocated");
    }
    let expected = SubAlloc::new(
        virtual_id,
        prop.initial_state.allocation.balances.sum(),
        prop.index_map.clone(),
    );
    match prop.update.state.allocation.sub_alloc(virtual_id) {
        Some(sub) if *sub == expected => {}
        _ => return Err("invalid sub-allocation"),
    }

    if parent_current.allocation.assets != prop.initial_state.allocation.assets {
        return Err("assets do not match");
    }

    // Sufficient collateral, and the parent balances shrink by exactly the
    // translated virtual balances.
    let translated = transform_balances(
        &prop.initial_state.allocation.balances,
        parent_current.allocation.balances.num_parts(),
        &prop.index_map,
    );
    match parent_current.allocation.balances.checked_sub(&translated) {
        Ok(expected_balances) if expected_balances == prop.update.state.allocation.balances => Ok(()),
        Ok(_) => Err("invalid balances"),
        Err(_) => Err("insufficient funds"),
    }
}

fn validate_virtual_settlement(
    parent_current: &State,
    prop: &VirtualSettlementProposal,
) -> Result<(), &'static str> {
    let virtual_id = prop.virtual_params.id();
    if virtual_id != prop.final_state.channel_id {
        return Err("state does not match parameters");
    }
    if !prop.final_state.is_final {
        return Err("state is not final");
    }
    verify_virtual_sigs(&prop.virtual_params, &prop.final_state, &prop.final_sigs)?;

    if parent_current.allocation.assets != prop.final_state.allocation.assets {
        return Err("assets do not match");
    }

    // Allocated before with exactly the final sums, gone after.
    let sub = match parent_current.allocation.sub_alloc(virtual_id) {
        Some(sub) => sub,
        None => return Err("virtual channel not allocated"),
    };
    if !sub.balances_equal(&prop.final_state.allocation.balances.sum()) {
        return Err("sub-allocation does not match final outcome");
    }
    if prop.update.state.allocation.sub_alloc(virtual_id).is_some() {
        return Err("virtual channel still allocated after update");
    }

    let translated = transform_balances(
        &prop.final_state.allocation.balances,
        parent_current.allocation.balances.num_parts(),
        &sub.index_map,
    );
    match parent_current.allocation.balances.checked_add(&translated) {
        Ok(expected_balances) if expected_balances == prop.update.state.allocation.balances => Ok(()),
        _ => Err("invalid balances"),
    }
}
