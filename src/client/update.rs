//! The two-party update protocol.
//!
//! Proposer: stage, sign, send, await the version-keyed response, then
//! promote or discard. Responder: validate, hand the proposed state to the
//! user handler, and answer through the move-only [UpdateResponder].

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use super::channel::UpdateResponse;
use super::{Channel, Error};
use crate::channel::{PartIdx, State, StateMachine};
use crate::wire::{Message, MsgUpdate, MsgUpdateAcc, MsgUpdateRej};

/// A channel update proposal as seen by the user handler.
#[derive(Debug, Clone)]
pub struct ChannelUpdate {
    /// The proposed new state.
    pub state: State,
    /// The participant causing the new state.
    pub actor_idx: PartIdx,
}

/// Decides how to handle incoming channel update requests from the peer.
#[async_trait]
pub trait UpdateHandler: Send + Sync + 'static {
    /// Called with the current state and the proposed update. The responder
    /// must be used to either accept or reject; it is consumed by use, so
    /// answering twice is unrepresentable.
    async fn handle_update(
        &self,
        current: State,
        update: ChannelUpdate,
        responder: UpdateResponder,
    );
}

/// Single-use answer to an incoming update request.
pub struct UpdateResponder {
    channel: Arc<Channel>,
    pidx: PartIdx,
    req: MsgUpdate,
    /// Whether accepting applies the update through the funding entry
    /// point, which admits sub-allocation changes.
    funding: bool,
}

impl UpdateResponder {
    pub(crate) fn new(channel: Arc<Channel>, pidx: PartIdx, req: MsgUpdate, funding: bool) -> Self {
        UpdateResponder {
            channel,
            pidx,
            req,
            funding,
        }
    }

    pub async fn accept(self) -> Result<(), Error> {
        self.channel
            .handle_update_acc(self.pidx, self.req, self.funding)
            .await
    }

    pub async fn reject(self, reason: &str) -> Result<(), Error> {
        self.channel
            .send_to_peer(Message::UpdateRej(MsgUpdateRej {
                channel_id: self.channel.id(),
                version: self.req.state.version,
                reason: reason.to_owned(),
            }))
            .await
    }
}

impl Channel {
    /// Proposes the next state, derived from the current one by `f`, to the
    /// peer and blocks until it is accepted, rejected, or timed out.
    /// `f` must not touch the version counter.
    pub async fn update_by<F>(&self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut State) -> Result<(), Error>,
    {
        let mut mach = self.lock_mach().await?;
        let mut next = mach.state()?.make_next();
        f(&mut next)?;
        self.propose_update_locked(&mut mach, next, false, Message::Update)
            .await
    }

    /// Proposes a final state with the current allocation, closing the
    /// channel cooperatively.
    pub async fn close(&self) -> Result<(), Error> {
        self.update_by(|state| {
            state.is_final = true;
            Ok(())
        })
        .await
    }

    /// Core proposer path; assumes the machine lock is held. On any
    /// failure, including timeout, the staged update is discarded.
    pub(crate) async fn propose_update_locked(
        &self,
        mach: &mut StateMachine,
        next: State,
        funding: bool,
        wrap: impl FnOnce(MsgUpdate) -> Message,
    ) -> Result<(), Error> {
        let version = next.version;
        let result = self.propose_update_inner(mach, next, funding, wrap).await;
        if let Err(err) = &result {
            // The original error is what the caller must see; a failing
            // discard cannot mask it.
            if let Err(derr) = mach.discard_update() {
                error!(id = ?self.id(), %derr, "discarding staged update failed");
            }
            self.drop_response_slot(version);
            warn!(id = ?self.id(), %err, "update proposal failed");
        }
        result
    }

    async fn propose_update_inner(
        &self,
        mach: &mut StateMachine,
        next: State,
        funding: bool,
        wrap: impl FnOnce(MsgUpdate) -> Message,
    ) -> Result<(), Error> {
        let client = self.client()?;
        let version = next.version;
        let is_final = next.is_final;
        let balances = next.allocation.balances.clone();

        if funding {
            mach.update_funding(next.clone(), self.idx())?;
        } else {
            mach.update(next.clone(), self.idx())?;
        }
        let sig = mach.sign(&client.signer)?;

        let rx = self.register_response_slot(version)?;
        self.send_to_peer(wrap(MsgUpdate {
            channel_id: self.id(),
            state: next,
            actor_idx: self.idx(),
            sig,
        }))
        .await?;

        let response = tokio::time::timeout(client.cfg.response_timeout, rx)
            .await
            .map_err(|_| Error::RequestTimedOut)?
            .map_err(|_| Error::ChannelClosed)?;

        match response {
            UpdateResponse::Rej(rej) => Err(Error::PeerRejected(rej.reason)),
            UpdateResponse::Acc(acc) => {
                mach.add_sig(self.peer_idx(), acc.sig)?;
                self.enable_notify_update(mach)?;
                if is_final && self.is_sub_channel() {
                    if let Some(parent) = self.parent() {
                        parent.register_sub_settlement(self.id(), balances);
                    }
                }
                Ok(())
            }
        }
    }

    /// Promotes the staged update (through `enable_final` for final
    /// states) and publishes the transition to the registered subscriber.
    pub(crate) fn enable_notify_update(&self, mach: &mut StateMachine) -> Result<(), Error> {
        let from = mach.state()?.clone();
        let to = match mach.staging_state() {
            Some(state) => state.clone(),
            None => return Err(crate::channel::MachineError::NoStagedUpdate.into()),
        };
        if to.is_final {
            mach.enable_final()?;
        } else {
            mach.enable_update()?;
        }
        self.notify_on_update(&from, &to);
        Ok(())
    }

    /// Responder entry, invoked from the wire-receive loop. Invalid
    /// messages are logged and dropped; the peer learns nothing it could
    /// not derive itself.
    pub(crate) async fn handle_update_req(
        self: &Arc<Self>,
        msg: MsgUpdate,
        handler: Option<Arc<dyn UpdateHandler>>,
    ) {
        let pidx = self.peer_idx();
        let current = {
            let mach = match self.lock_mach().await {
                Ok(guard) => guard,
                Err(err) => {
                    warn!(id = ?self.id(), %err, "machine busy, dropping update request");
                    return;
                }
            };

            // Only update proposals with the proposing peer as actor are
            // allowed between two parties.
            if msg.actor_idx != pidx {
                warn!(id = ?self.id(), actor = msg.actor_idx, "update actor is not the proposer");
                return;
            }

            // A final sub-channel is paid out through a parent update that
            // exactly matches the registered expectation; that path skips
            // the user handler.
            if self.matches_sub_settlement(&mach, &msg) {
                drop(mach);
                let responder = UpdateResponder::new(Arc::clone(self), pidx, msg, true);
                if let Err(err) = responder.accept().await {
                    error!(id = ?self.id(), %err, "accepting sub-channel settlement failed");
                }
                return;
            }

            if let Err(err) = mach.check_update(&msg.state, msg.actor_idx, &msg.sig, pidx) {
                warn!(id = ?self.id(), %err, "invalid update dropped");
                return;
            }

            match mach.state() {
                Ok(state) => state.clone(),
                Err(err) => {
                    warn!(id = ?self.id(), %err, "update before current state exists");
                    return;
                }
            }
        };

        let update = ChannelUpdate {
            state: msg.state.clone(),
            actor_idx: msg.actor_idx,
        };
        let responder = UpdateResponder::new(Arc::clone(self), pidx, msg, false);
        match handler {
            Some(handler) => handler.handle_update(current, update, responder).await,
            None => warn!(id = ?self.id(), "no update handler registered, dropping update"),
        }
    }

    /// Whether `msg` is exactly the settlement update we expect for some
    /// final sub-channel of this channel.
    fn matches_sub_settlement(&self, mach: &StateMachine, msg: &MsgUpdate) -> bool {
        let current = match mach.state() {
            Ok(state) => state,
            Err(_) => return false,
        };
        let settlements = self.sub_settlements.lock().unwrap();
        for (child, translated) in settlements.iter() {
            let sub = match current.allocation.sub_alloc(*child) {
                Some(sub) => sub.clone(),
                None => continue,
            };
            let mut expected = current.make_next();
            expected.allocation.balances = match expected.allocation.balances.checked_add(translated)
            {
                Ok(balances) => balances,
                Err(_) => continue,
            };
            if expected.allocation.remove_sub_alloc(sub.id).is_err() {
                continue;
            }
            if expected.encoding_equal(&msg.state) {
                return true;
            }
        }
        false
    }

    /// Accept path of the responder. Before our accept signature is sent,
    /// failures discard the staged update; after it is sent, rollback is
    /// unsafe (the peer may hold a fully-signed state), so failures
    /// surface as [Error::OutOfSync] and the channel is left for the
    /// watcher and dispute path.
    pub(crate) async fn handle_update_acc(
        &self,
        pidx: PartIdx,
        req: MsgUpdate,
        funding: bool,
    ) -> Result<(), Error> {
        let mut mach = self.lock_mach().await?;
        let client = self.client()?;

        let staged = (|| -> Result<crate::wallet::Signature, Error> {
            if funding {
                mach.update_funding(req.state.clone(), req.actor_idx)?;
            } else {
                mach.update(req.state.clone(), req.actor_idx)?;
            }
            mach.add_sig(pidx, req.sig)?;
            Ok(mach.sign(&client.signer)?)
        })();
        let sig = match staged {
            Ok(sig) => sig,
            Err(err) => {
                let _ = mach.discard_update();
                return Err(err);
            }
        };

        // A final sub-channel asks the parent for a settlement update.
        if req.state.is_final && self.is_sub_channel() {
            if let Some(parent) = self.parent() {
                parent.register_sub_settlement(self.id(), req.state.allocation.balances.clone());
            }
        }

        if let Err(err) = self
            .send_to_peer(Message::UpdateAcc(MsgUpdateAcc {
                channel_id: self.id(),
                version: req.state.version,
                sig,
            }))
            .await
        {
            let _ = mach.discard_update();
            return Err(err);
        }

        self.enable_notify_update(&mut mach).map_err(|err| {
            error!(
                id = ?self.id(),
                %err,
                "failed to enable update after sent signature, channel out of sync"
            );
            match err {
                Error::Machine(m) => Error::OutOfSync(m),
                other => other,
            }
        })
    }
}
