use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::{
    AdjudicatorCall, AdjudicatorEvent, AdjudicatorReq, ChainBackend, ChainError, ChainId, EventSub,
    ProgressReq, StateMap, TxHash,
};
use crate::adjudicator::Adjudicator;
use crate::channel::{Asset, ChannelId, SignedState, State};

/// How many extra blocks the secondary party waits for the initiator's
/// conclude before submitting its own.
const SECONDARY_WAIT_BLOCKS: u64 = 2;

/// Adjudicator over one [ChainBackend] per chain.
///
/// Transaction submission is serialized per backend; the backend set of an
/// operation is derived from the chain IDs of all assets it touches.
pub struct MultiAdjudicator {
    backends: RwLock<HashMap<ChainId, Backend>>,
}

#[derive(Clone)]
struct Backend {
    chain_id: ChainId,
    handle: Arc<dyn ChainBackend>,
    tx_mu: Arc<Mutex<()>>,
}

impl Default for MultiAdjudicator {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiAdjudicator {
    pub fn new() -> Self {
        MultiAdjudicator {
            backends: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the contract handle for a chain ID. Replaces any previous
    /// handle for the same chain.
    pub fn register_backend(&self, chain_id: ChainId, handle: Arc<dyn ChainBackend>) {
        self.backends.write().unwrap().insert(
            chain_id,
            Backend {
                chain_id,
                handle,
                tx_mu: Arc::new(Mutex::new(())),
            },
        );
    }

    /// The deduplicated backend set for the given asset lists. Missing a
    /// backend for any referenced chain is a hard error.
    fn backend_set(&self, asset_lists: &[&[Asset]]) -> Result<Vec<Backend>, ChainError> {
        let backends = self.backends.read().unwrap();
        let mut set: HashMap<ChainId, Backend> = HashMap::new();
        for assets in asset_lists {
            for asset in *assets {
                let backend = backends
                    .get(&asset.chain_id)
                    .ok_or(ChainError::NoBackendForChain(asset.chain_id))?;
                set.insert(asset.chain_id, backend.clone());
            }
        }
        Ok(set.into_values().collect())
    }

    /// Submits under the backend's transaction mutex, then confirms outside
    /// of it.
    async fn call(&self, backend: &Backend, call: AdjudicatorCall) -> Result<(), ChainError> {
        let tx = self.submit(backend, call).await?;
        backend.handle.confirm(tx).await
    }

    async fn submit(&self, backend: &Backend, call: AdjudicatorCall) -> Result<TxHash, ChainError> {
        let _guard = backend.tx_mu.lock().await;
        let tx = backend.handle.submit(call).await?;
        debug!(chain = ?backend.chain_id, tx = ?tx, "sent transaction");
        Ok(tx)
    }

    async fn ensure_concluded(
        &self,
        req: AdjudicatorReq,
        sub_states: StateMap,
    ) -> Result<(), ChainError> {
        let sub_asset_lists: Vec<&[Asset]> = sub_states
            .values()
            .map(|s| s.allocation.assets.as_slice())
            .collect();
        let mut asset_lists = vec![req.tx.state.allocation.assets.as_slice()];
        asset_lists.extend(sub_asset_lists);
        let backends = self.backend_set(&asset_lists)?;

        let mut join = JoinSet::new();
        for backend in backends {
            let req = req.clone();
            let sub_states = sub_states.clone();
            join.spawn(async move { ensure_concluded_backend(backend, req, sub_states).await });
        }

        let mut result = Ok(());
        while let Some(joined) = join.join_next().await {
            let one = joined.unwrap_or(Err(ChainError::SubscriptionClosed));
            if result.is_ok() {
                result = one;
            }
        }
        result
    }
}

#[async_trait]
impl Adjudicator for MultiAdjudicator {
    async fn register(
        &self,
        req: AdjudicatorReq,
        sub_channels: &[SignedState],
    ) -> Result<(), ChainError> {
        let mut asset_lists = vec![req.tx.state.allocation.assets.as_slice()];
        asset_lists.extend(sub_channels.iter().map(|s| s.state.allocation.assets.as_slice()));
        let backends = self.backend_set(&asset_lists)?;

        for backend in backends {
            let call = AdjudicatorCall::Register {
                channel: req.tx.clone(),
                sub_channels: sub_channels.to_vec(),
            };
            if let Err(err) = self.call(&backend, call).await {
                warn!(chain = ?backend.chain_id, %err, "register failed");
                return Err(err);
            }
        }
        Ok(())
    }

    async fn progress(&self, req: ProgressReq) -> Result<(), ChainError> {
        let backends = self.backend_set(&[
            req.base.tx.state.allocation.assets.as_slice(),
            req.new_state.allocation.assets.as_slice(),
        ])?;

        for backend in backends {
            let call = AdjudicatorCall::Progress {
                params: req.base.params.clone(),
                old_state: req.base.tx.state.clone(),
                new_state: req.new_state.clone(),
                actor_idx: req.base.idx,
                sig: req.sig,
            };
            self.call(&backend, call).await?;
        }
        Ok(())
    }

    async fn withdraw(&self, req: AdjudicatorReq, sub_states: StateMap) -> Result<(), ChainError> {
        self.ensure_concluded(req, sub_states).await
    }

    async fn subscribe(&self, channel_id: ChannelId) -> Result<EventSub, ChainError> {
        let backends: Vec<Backend> = self.backends.read().unwrap().values().cloned().collect();
        let mut receivers = Vec::with_capacity(backends.len());
        for backend in backends {
            receivers.push(backend.handle.subscribe_events(channel_id).await?);
        }
        Ok(EventSub::new(receivers))
    }
}

/// Drives one backend to the Concluded phase.
///
/// Fast path: a past Concluded event means success without a transaction.
/// A reverted conclude is suppressed (another party may have concluded
/// first); the Concluded event is awaited in every case. The wait is
/// bounded by the caller's cancellation.
async fn ensure_concluded_backend(
    backend: Backend,
    req: AdjudicatorReq,
    sub_states: StateMap,
) -> Result<(), ChainError> {
    let channel_id = req.params.id();
    let mut events = backend.handle.subscribe_events(channel_id).await?;

    let past = backend.handle.past_events(channel_id).await?;
    if past
        .iter()
        .any(|e| matches!(e, AdjudicatorEvent::Concluded { .. }))
    {
        return Ok(());
    }

    if req.tx.state.is_final && req.secondary {
        let wait_blocks = SECONDARY_WAIT_BLOCKS + backend.handle.tx_finality_depth();
        if wait_concluded_for_n_blocks(&backend, &mut events, wait_blocks).await? {
            return Ok(());
        }
    }

    // The on-chain state of a forced execution is not fully signed, so
    // conclude_final is only available for final states that were not
    // force-executed.
    let force_executed = matches!(past.last(), Some(AdjudicatorEvent::Progressed { .. }));
    let call = if req.tx.state.is_final && !force_executed {
        AdjudicatorCall::ConcludeFinal {
            params: req.params.clone(),
            state: req.tx.state.clone(),
            sigs: req.tx.sigs.clone(),
        }
    } else {
        AdjudicatorCall::Conclude {
            params: req.params.clone(),
            state: req.tx.state.clone(),
            sub_states: sub_states_tree(&req.tx.state, &sub_states)?,
        }
    };

    let submitted = {
        let _guard = backend.tx_mu.lock().await;
        backend.handle.submit(call).await
    };
    match submitted {
        Ok(tx) => match backend.handle.confirm(tx).await {
            Ok(()) => {}
            Err(ChainError::TxFailed(reason)) => {
                warn!(chain = ?backend.chain_id, %reason, "conclude reverted, waiting for event anyway");
            }
            Err(err) => return Err(err),
        },
        Err(ChainError::TxFailed(reason)) => {
            warn!(chain = ?backend.chain_id, %reason, "conclude rejected, waiting for event anyway");
        }
        Err(err) => return Err(err),
    }

    loop {
        match events.recv().await {
            Some(AdjudicatorEvent::Concluded { .. }) => return Ok(()),
            Some(_) => continue,
            None => return Err(ChainError::SubscriptionClosed),
        }
    }
}

/// Waits up to `n` blocks for a Concluded event. Returns whether one
/// arrived.
async fn wait_concluded_for_n_blocks(
    backend: &Backend,
    events: &mut mpsc::Receiver<AdjudicatorEvent>,
    n: u64,
) -> Result<bool, ChainError> {
    let mut blocks = backend.handle.subscribe_blocks().await?;
    let mut seen = 0;
    while seen < n {
        tokio::select! {
            block = blocks.recv() => match block {
                Some(_) => seen += 1,
                None => return Err(ChainError::ChainUnreachable),
            },
            event = events.recv() => match event {
                Some(AdjudicatorEvent::Concluded { .. }) => return Ok(true),
                Some(_) => {}
                None => return Err(ChainError::SubscriptionClosed),
            },
        }
    }
    Ok(false)
}

/// Flattens the sub-channel tree below `state` depth-first.
fn sub_states_tree(state: &State, sub_states: &StateMap) -> Result<Vec<State>, ChainError> {
    let mut out = Vec::new();
    for sub_alloc in &state.allocation.locked {
        let sub = sub_states
            .get(&sub_alloc.id)
            .ok_or(ChainError::MissingSubState(sub_alloc.id))?;
        out.push(sub.clone());
        out.extend(sub_states_tree(sub, sub_states)?);
    }
    Ok(out)
}
