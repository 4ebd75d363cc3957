//! Watcher and dispute handling: mirroring adjudicator events into machine
//! phases, refuting stale registrations, and settling channels.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{Channel, Client, Error};
use crate::adjudicator::{AdjudicatorEvent, AdjudicatorReq, ProgressReq, StateMap};
use crate::channel::{state_hash, ChannelId, Phase, SignedState, State};
use crate::wire::Message;

/// User callback for adjudicator events. Dispatched on a separate task;
/// the watcher never awaits it.
pub trait AdjudicatorEventHandler: Send + Sync + 'static {
    fn handle_event(&self, event: AdjudicatorEvent);
}

impl Channel {
    /// Watches the adjudicator for events on this channel and responds.
    ///
    /// Registrations of stale states are refuted by registering the whole
    /// channel tree with the freshest local state. An on-chain version
    /// ahead of our local state cannot happen in a correct protocol run
    /// and surfaces as [Error::EventAheadOfLocal].
    ///
    /// Runs until the subscription closes or an error occurs.
    pub async fn watch(
        self: &Arc<Self>,
        handler: Arc<dyn AdjudicatorEventHandler>,
    ) -> Result<(), Error> {
        let client = self.client()?;
        let mut sub = client.adjudicator.subscribe(self.id()).await?;
        info!(id = ?self.id(), "watcher started");

        while let Some(event) = sub.next().await {
            debug!(id = ?self.id(), ?event, "adjudicator event");

            {
                let mut mach = self.lock_mach().await?;
                match &event {
                    AdjudicatorEvent::Registered { .. } => mach.set_phase(Phase::Registered)?,
                    AdjudicatorEvent::Progressed { state, .. } => {
                        mach.set_progressed(state.clone())?
                    }
                    // No corresponding machine phase.
                    AdjudicatorEvent::Concluded { .. } => {}
                }
            }

            if let AdjudicatorEvent::Registered { version, .. } = &event {
                let local = self.state().await?.version;
                if *version > local {
                    error!(
                        id = ?self.id(),
                        local,
                        event = *version,
                        "chain knows a newer state than we do"
                    );
                    return Err(Error::EventAheadOfLocal {
                        local,
                        event: *version,
                    });
                }
                if *version < local {
                    self.register().await?;
                }
            }

            let handler = Arc::clone(&handler);
            let event = event.clone();
            tokio::spawn(async move { handler.handle_event(event) });
        }

        info!(id = ?self.id(), "watcher returned");
        Ok(())
    }

    /// Registers this channel's tree on the adjudicator: ascend to the
    /// root, lock every machine in the tree, push all phases to
    /// `Registering`, submit the gathered signed states, then mark
    /// everything `Registered`.
    pub async fn register(self: &Arc<Self>) -> Result<(), Error> {
        let mut root = Arc::clone(self);
        while let Some(parent) = root.parent() {
            root = Arc::clone(parent);
        }
        let client = root.client()?;

        // Lock the tree top-down. Guards release on every exit path; a
        // failure during gather leaves phases as last observed.
        let mut channels = vec![Arc::clone(&root)];
        let mut guards = Vec::new();
        let mut next = 0;
        while next < channels.len() {
            let channel = Arc::clone(&channels[next]);
            let guard = channel.lock_mach().await?;
            for sub in &guard.state()?.allocation.locked {
                channels.push(client.channel(sub.id)?);
            }
            guards.push(guard);
            next += 1;
        }

        for guard in guards.iter_mut() {
            guard.set_phase(Phase::Registering)?;
        }

        let req = AdjudicatorReq {
            params: guards[0].params().clone(),
            idx: guards[0].idx(),
            tx: guards[0].signed_state()?,
            secondary: false,
        };
        let sub_channels: Vec<SignedState> = guards[1..]
            .iter()
            .map(|g| g.signed_state())
            .collect::<Result<_, _>>()?;

        client.adjudicator.register(req, &sub_channels).await?;

        for guard in guards.iter_mut() {
            guard.set_phase(Phase::Registered)?;
        }
        Ok(())
    }

    /// Posts a forced state progression derived from the current state.
    pub async fn progress_by(
        self: &Arc<Self>,
        update: impl FnOnce(&mut State),
    ) -> Result<(), Error> {
        let mut mach = self.lock_mach().await?;
        let client = self.client()?;

        let base = AdjudicatorReq {
            params: mach.params().clone(),
            idx: mach.idx(),
            tx: mach.signed_state()?,
            secondary: false,
        };

        let mut state = mach.state()?.make_next();
        update(&mut state);
        mach.set_progressing(state.clone())?;
        let sig = client.signer.sign(state_hash(mach.params(), &state)?);

        client
            .adjudicator
            .progress(ProgressReq {
                base,
                new_state: state,
                sig,
            })
            .await?;
        Ok(())
    }

    /// Concludes the channel and withdraws the funds.
    ///
    /// Ledger channels conclude on-chain across every backend their assets
    /// touch. Sub- and virtual channels fold their outcome back into the
    /// parent channel off-chain.
    pub async fn settle(self: &Arc<Self>, secondary: bool) -> Result<(), Error> {
        let client = self.client()?;

        // Counterparty copies are retired by the settlement matcher, not
        // through this flow.
        if self.is_watch_only() {
            return Err(Error::ChannelClosed);
        }

        if self.is_ledger_channel() {
            let req = {
                let mut mach = self.lock_mach().await?;
                mach.set_phase(Phase::Withdrawing)?;
                AdjudicatorReq {
                    params: mach.params().clone(),
                    idx: mach.idx(),
                    tx: mach.signed_state()?,
                    secondary,
                }
            };
            let sub_states = self.gather_sub_states(&client).await?;
            client.adjudicator.withdraw(req, sub_states).await?;
        } else {
            {
                let mut mach = self.lock_mach().await?;
                if !mach.state()?.allocation.locked.is_empty() {
                    return Err(Error::InvalidProposal(
                        "cannot settle off-chain with locked funds",
                    ));
                }
                mach.set_phase(Phase::Withdrawing)?;
            }
            let parent = Arc::clone(
                self.parent()
                    .ok_or(Error::InvalidProposal("channel has no parent"))?,
            );
            if self.is_virtual_channel() {
                parent.withdraw_virtual(self).await?;
            } else {
                parent.withdraw_sub_channel(self).await?;
            }
        }

        {
            let mut mach = self.lock_mach().await?;
            mach.set_phase(Phase::Withdrawn)?;
        }
        client.remove_channel(self.id());
        info!(id = ?self.id(), "withdrawal successful");
        Ok(())
    }

    /// Latest states of every channel below this one, keyed by ID.
    async fn gather_sub_states(&self, client: &Arc<Client>) -> Result<StateMap, Error> {
        let mut map = StateMap::new();
        let mut pending: Vec<ChannelId> = self
            .state()
            .await?
            .allocation
            .locked
            .iter()
            .map(|sub| sub.id)
            .collect();
        while let Some(id) = pending.pop() {
            let channel = client.channel(id)?;
            let state = channel.state().await?;
            pending.extend(state.allocation.locked.iter().map(|sub| sub.id));
            map.insert(id, state);
        }
        Ok(map)
    }

    /// Folds a final sub-channel back into this (parent) channel with a
    /// plain update. The peer auto-accepts it against the expectation
    /// registered when the sub-channel became final.
    pub(crate) async fn withdraw_sub_channel(
        self: &Arc<Self>,
        sub_ch: &Arc<Channel>,
    ) -> Result<(), Error> {
        let mut mach = self.lock_mach().await?;

        let sub_signed = {
            let sm = sub_ch.mach.lock().await;
            sm.signed_state()?
        };

        let current = mach.state()?;
        let sub = current
            .allocation
            .sub_alloc(sub_ch.id())
            .ok_or(crate::channel::AllocationError::NotAllocated(sub_ch.id()))?
            .clone();
        if !sub.balances_equal(&sub_signed.state.allocation.balances.sum()) {
            return Err(crate::channel::AllocationError::InvalidAllocation.into());
        }

        let mut next = current.make_next();
        next.allocation.balances = next
            .allocation
            .balances
            .checked_add(&sub_signed.state.allocation.balances)?;
        next.allocation.remove_sub_alloc(sub_ch.id())?;

        let result = self
            .propose_update_locked(&mut mach, next, true, Message::Update)
            .await;
        if result.is_ok() {
            self.sub_settlements.lock().unwrap().remove(&sub_ch.id());
        }
        result
    }
}

impl Client {
    /// Convenience: watch every currently-open channel with one handler.
    pub fn spawn_watcher(
        self: &Arc<Self>,
        channel: Arc<Channel>,
        handler: Arc<dyn AdjudicatorEventHandler>,
    ) -> tokio::task::JoinHandle<Result<(), Error>> {
        tokio::spawn(async move {
            let result = channel.watch(handler).await;
            if let Err(err) = &result {
                warn!(id = ?channel.id(), %err, "watcher failed");
            }
            result
        })
    }
}
