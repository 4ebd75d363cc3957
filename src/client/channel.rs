use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, warn};

use super::{Client, Error};
use crate::channel::{
    Balances, ChannelId, Params, PartIdx, Phase, State, StateMachine,
};
use crate::wire::{self, Envelope, Message};

pub(crate) enum UpdateResponse {
    Acc(wire::MsgUpdateAcc),
    Rej(wire::MsgUpdateRej),
}

/// A live channel: the state machine plus everything the protocols need
/// around it (mutex, response routing, parent link).
///
/// Sub- and virtual channels hold a non-owning back-reference to their
/// parent; the owning container is the client's channel registry. The
/// parent link is installed at creation and never mutated.
pub struct Channel {
    client: Weak<Client>,
    id: ChannelId,
    idx: PartIdx,
    peers: wire::Peers,
    params: Params,
    parent: Option<Arc<Channel>>,
    /// For virtual channels: maps our side's participant indices into the
    /// parent. `None` for ledger and sub channels.
    index_map: Option<Vec<PartIdx>>,
    /// A persisted counterparty copy (the intermediary's view of a virtual
    /// channel); it never signs and never sends.
    watch_only: bool,

    pub(crate) mach: Arc<AsyncMutex<StateMachine>>,
    response_slots: StdMutex<HashMap<u64, oneshot::Sender<UpdateResponse>>>,
    on_update: StdMutex<Option<Box<dyn Fn(&State, &State) + Send + Sync>>>,
    init_signal: watch::Sender<bool>,
    /// Final sub-channel balances (already translated into our indices)
    /// that we expect a settlement update to pay back.
    pub(crate) sub_settlements: StdMutex<HashMap<ChannelId, Balances>>,
}

impl Channel {
    pub(crate) fn new(
        client: &Arc<Client>,
        params: Params,
        idx: PartIdx,
        peers: wire::Peers,
        parent: Option<Arc<Channel>>,
        index_map: Option<Vec<PartIdx>>,
        watch_only: bool,
    ) -> Result<Arc<Self>, Error> {
        let mach = StateMachine::new(params.clone(), idx)?;
        let (init_signal, _) = watch::channel(false);
        Ok(Arc::new(Channel {
            client: Arc::downgrade(client),
            id: params.id(),
            idx,
            peers,
            params,
            parent,
            index_map,
            watch_only,
            mach: Arc::new(AsyncMutex::new(mach)),
            response_slots: StdMutex::new(HashMap::new()),
            on_update: StdMutex::new(None),
            init_signal,
            sub_settlements: StdMutex::new(HashMap::new()),
        }))
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn idx(&self) -> PartIdx {
        self.idx
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn parent(&self) -> Option<&Arc<Channel>> {
        self.parent.as_ref()
    }

    pub(crate) fn index_map(&self) -> Option<&Vec<PartIdx>> {
        self.index_map.as_ref()
    }

    pub(crate) fn is_watch_only(&self) -> bool {
        self.watch_only
    }

    pub fn is_ledger_channel(&self) -> bool {
        self.params.ledger_channel
    }

    pub fn is_virtual_channel(&self) -> bool {
        self.params.virtual_channel
    }

    pub fn is_sub_channel(&self) -> bool {
        !self.params.ledger_channel && !self.params.virtual_channel
    }

    /// The other participant's index. Channels are two-party.
    pub fn peer_idx(&self) -> PartIdx {
        1 - self.idx
    }

    pub(crate) fn peer_wire_addr(&self) -> &wire::Address {
        &self.peers[self.peer_idx() as usize]
    }

    pub(crate) fn client(&self) -> Result<Arc<Client>, Error> {
        self.client.upgrade().ok_or(Error::ChannelClosed)
    }

    /// Acquires the machine mutex, bounded by the configured lock timeout.
    pub(crate) async fn lock_mach(&self) -> Result<OwnedMutexGuard<StateMachine>, Error> {
        let timeout = self
            .client()
            .map(|c| c.cfg.lock_timeout)
            .unwrap_or(Duration::from_secs(1));
        tokio::time::timeout(timeout, Arc::clone(&self.mach).lock_owned())
            .await
            .map_err(|_| Error::LockTimeout)
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> Result<State, Error> {
        let mach = self.mach.lock().await;
        Ok(mach.state()?.clone())
    }

    /// The current state with all signatures, as it would go on-chain.
    pub async fn signed_state(&self) -> Result<crate::channel::SignedState, Error> {
        let mach = self.mach.lock().await;
        Ok(mach.signed_state()?)
    }

    pub async fn phase(&self) -> Phase {
        self.mach.lock().await.phase()
    }

    /// Registers the single state-transition subscriber. A second call
    /// replaces the first.
    pub fn on_update(&self, cb: impl Fn(&State, &State) + Send + Sync + 'static) {
        *self.on_update.lock().unwrap() = Some(Box::new(cb));
    }

    pub(crate) fn notify_on_update(&self, from: &State, to: &State) {
        if let Some(cb) = self.on_update.lock().unwrap().as_ref() {
            cb(from, to);
        }
    }

    pub(crate) async fn send_to_peer(&self, msg: Message) -> Result<(), Error> {
        let client = self.client()?;
        let env = Envelope {
            sender: self.peers[self.idx as usize].clone(),
            recipient: self.peer_wire_addr().clone(),
            msg,
        };
        client.bus.publish(env).await?;
        Ok(())
    }

    /// Registers a response slot for an update at `version`. Only
    /// responses carrying exactly this version will be delivered; all
    /// others are dropped at the receiver layer.
    pub(crate) fn register_response_slot(
        &self,
        version: u64,
    ) -> Result<oneshot::Receiver<UpdateResponse>, Error> {
        use std::collections::hash_map::Entry;
        let mut slots = self.response_slots.lock().unwrap();
        match slots.entry(version) {
            Entry::Occupied(_) => Err(Error::Machine(
                crate::channel::MachineError::StagedUpdateInProgress,
            )),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(tx);
                Ok(rx)
            }
        }
    }

    pub(crate) fn drop_response_slot(&self, version: u64) {
        self.response_slots.lock().unwrap().remove(&version);
    }

    pub(crate) async fn route_update_acc(self: &Arc<Self>, msg: wire::MsgUpdateAcc) {
        if msg.version == 0 {
            let is_init = { self.mach.lock().await.phase() == Phase::InitSigning };
            if is_init {
                self.route_init_sig(msg).await;
                return;
            }
        }
        let slot = self.response_slots.lock().unwrap().remove(&msg.version);
        match slot {
            Some(tx) => {
                let _ = tx.send(UpdateResponse::Acc(msg));
            }
            None => debug!(version = msg.version, "accept without matching request dropped"),
        }
    }

    pub(crate) fn route_update_rej(&self, msg: wire::MsgUpdateRej) {
        let slot = self.response_slots.lock().unwrap().remove(&msg.version);
        match slot {
            Some(tx) => {
                let _ = tx.send(UpdateResponse::Rej(msg));
            }
            None => debug!(version = msg.version, "reject without matching request dropped"),
        }
    }

    /// Applies a peer's signature on the initial state. Once all
    /// signatures are in, the version-0 state is enabled and the opening
    /// flow is released.
    pub(crate) async fn route_init_sig(&self, msg: wire::MsgUpdateAcc) {
        let mut mach = self.mach.lock().await;
        if mach.phase() != Phase::InitSigning {
            debug!(id = ?self.id, "initial signature in phase {:?} dropped", mach.phase());
            return;
        }
        if let Err(err) = mach.add_sig(self.peer_idx(), msg.sig) {
            warn!(id = ?self.id, %err, "invalid initial signature dropped");
            return;
        }
        if mach.staging_sigs_complete() {
            match mach.enable_init() {
                Ok(()) => {
                    // send_replace updates the value even when nobody
                    // subscribed yet.
                    self.init_signal.send_replace(true);
                }
                Err(err) => warn!(id = ?self.id, %err, "enabling initial state failed"),
            }
        }
    }

    /// Waits until the initial state is fully signed and enabled.
    pub(crate) async fn await_init_complete(&self, timeout: Duration) -> Result<(), Error> {
        let mut rx = self.init_signal.subscribe();
        let wait = async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::RequestTimedOut)?;
        if *self.init_signal.subscribe().borrow() {
            Ok(())
        } else {
            Err(Error::ChannelClosed)
        }
    }

    /// Records that a settlement update for `child` must pay exactly
    /// `translated` back into this channel.
    pub(crate) fn register_sub_settlement(&self, child: ChannelId, translated: Balances) {
        self.sub_settlements.lock().unwrap().insert(child, translated);
    }
}
