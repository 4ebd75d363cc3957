use serde::{Deserialize, Serialize};

use super::{
    allocation::sub_allocs_equal, state_hash, Allocation, AllocationError, Params, PartIdx, State,
};
use crate::{
    binenc,
    wallet::{self, Signature, Signer},
};

/// Lifecycle phase of a channel machine.
///
/// `Acting ↔ Signing` is the hot loop; everything from `Registering` onward
/// is driven by the watcher and the settle call.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    InitActing,
    InitSigning,
    Funding,
    Acting,
    Signing,
    Final,
    Registering,
    Registered,
    Progressing,
    Progressed,
    Withdrawing,
    Withdrawn,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MachineError {
    #[error("version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u64, got: u64 },
    #[error("invalid actor index {0}")]
    InvalidActor(PartIdx),
    #[error("sub-allocations changed")]
    SubAllocChanged,
    #[error("signature does not verify against participant {0}")]
    BadSignature(PartIdx),
    #[error("participant {0} already signed")]
    AlreadySigned(PartIdx),
    #[error("missing signature of participant {missing}")]
    SignaturesIncomplete { missing: PartIdx },
    #[error("channel state is final")]
    AlreadyFinal,
    #[error("state does not belong to this channel")]
    IdMismatch,
    #[error("no staged update")]
    NoStagedUpdate,
    #[error("an update is already staged")]
    StagedUpdateInProgress,
    #[error("operation {op} not allowed in phase {phase:?}")]
    InvalidPhase { phase: Phase, op: &'static str },
    #[error("phase transition {from:?} -> {to:?} not allowed")]
    InvalidTransition { from: Phase, to: Phase },
    #[error("account is not a participant of this channel")]
    NotParticipant,
    #[error(transparent)]
    Allocation(#[from] AllocationError),
    #[error(transparent)]
    Encoding(#[from] binenc::Error),
}

/// A state plus the signatures collected for it so far, ordered by
/// participant index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub state: State,
    pub sigs: Vec<Option<Signature>>,
}

impl Transaction {
    fn new(state: State, num_parts: usize) -> Self {
        Transaction {
            state,
            sigs: vec![None; num_parts],
        }
    }

    /// Index of the first missing signature, if any.
    pub fn missing_sig(&self) -> Option<PartIdx> {
        self.sigs
            .iter()
            .position(Option::is_none)
            .map(|i| i as PartIdx)
    }
}

/// A fully-signed state, ready to be sent on-chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedState {
    pub params: Params,
    pub state: State,
    pub sigs: Vec<Signature>,
}

#[derive(Debug, Clone)]
struct StagedUpdate {
    tx: Transaction,
    #[allow(dead_code)]
    actor: PartIdx,
}

/// Per-channel state machine: versions, signatures, phases, and the
/// staged-vs-current update bookkeeping.
///
/// The machine is purely local; callers provide mutual exclusion (the
/// per-channel mutex) and drive all transitions explicitly.
#[derive(Debug, Clone)]
pub struct StateMachine {
    params: Params,
    idx: PartIdx,
    phase: Phase,
    curr: Option<Transaction>,
    staged: Option<StagedUpdate>,
}

impl StateMachine {
    pub fn new(params: Params, idx: PartIdx) -> Result<Self, MachineError> {
        if (idx as usize) >= params.num_parts() {
            return Err(MachineError::InvalidActor(idx));
        }
        Ok(StateMachine {
            params,
            idx,
            phase: Phase::InitActing,
            curr: None,
            staged: None,
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn idx(&self) -> PartIdx {
        self.idx
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The current (last enabled) state.
    pub fn state(&self) -> Result<&State, MachineError> {
        self.curr
            .as_ref()
            .map(|tx| &tx.state)
            .ok_or(MachineError::InvalidPhase {
                phase: self.phase,
                op: "state",
            })
    }

    pub fn staging_state(&self) -> Option<&State> {
        self.staged.as_ref().map(|s| &s.tx.state)
    }

    /// Whether a staged update exists and carries every signature.
    pub fn staging_sigs_complete(&self) -> bool {
        matches!(self.staged.as_ref(), Some(staged) if staged.tx.missing_sig().is_none())
    }

    /// The current transaction as a fully-signed state. Fails with
    /// `SignaturesIncomplete` if any signature is missing.
    pub fn signed_state(&self) -> Result<SignedState, MachineError> {
        let tx = self.curr.as_ref().ok_or(MachineError::InvalidPhase {
            phase: self.phase,
            op: "signed_state",
        })?;
        if let Some(missing) = tx.missing_sig() {
            return Err(MachineError::SignaturesIncomplete { missing });
        }
        Ok(SignedState {
            params: self.params.clone(),
            state: tx.state.clone(),
            sigs: tx.sigs.iter().map(|s| s.unwrap()).collect(),
        })
    }

    /// Stages the version-0 state. Moves `InitActing -> InitSigning`.
    pub fn init(&mut self, allocation: Allocation, app_data: Vec<u8>) -> Result<&State, MachineError> {
        self.expect_phase(Phase::InitActing, "init")?;
        allocation.validate()?;
        let state = State::new(&self.params, allocation, app_data);
        let num_parts = self.params.num_parts();
        self.staged = Some(StagedUpdate {
            tx: Transaction::new(state, num_parts),
            actor: self.idx,
        });
        self.phase = Phase::InitSigning;
        Ok(self.staging_state().unwrap())
    }

    /// Signs the staged state with the given signer and records the
    /// signature at our own index.
    pub fn sign(&mut self, signer: &Signer) -> Result<Signature, MachineError> {
        if signer.address() != self.params.participants[self.idx as usize] {
            return Err(MachineError::NotParticipant);
        }
        let idx = self.idx as usize;
        let staged = self.staged.as_mut().ok_or(MachineError::NoStagedUpdate)?;
        if staged.tx.sigs[idx].is_some() {
            return Err(MachineError::AlreadySigned(self.idx));
        }
        let hash = state_hash(&self.params, &staged.tx.state)?;
        let sig = signer.sign(hash);
        staged.tx.sigs[idx] = Some(sig);
        Ok(sig)
    }

    /// Verifies and records a signature on the staged state.
    pub fn add_sig(&mut self, idx: PartIdx, sig: Signature) -> Result<(), MachineError> {
        if (idx as usize) >= self.params.num_parts() {
            return Err(MachineError::InvalidActor(idx));
        }
        let staged = self.staged.as_ref().ok_or(MachineError::NoStagedUpdate)?;
        let hash = state_hash(&self.params, &staged.tx.state)?;
        if !wallet::verify(hash, self.params.participants[idx as usize], &sig) {
            return Err(MachineError::BadSignature(idx));
        }
        let staged = self.staged.as_mut().unwrap();
        if staged.tx.sigs[idx as usize].is_some() {
            return Err(MachineError::AlreadySigned(idx));
        }
        staged.tx.sigs[idx as usize] = Some(sig);
        Ok(())
    }

    /// Promotes the fully-signed version-0 state. `InitSigning -> Funding`.
    pub fn enable_init(&mut self) -> Result<(), MachineError> {
        self.expect_phase(Phase::InitSigning, "enable_init")?;
        self.promote_staged()?;
        self.phase = Phase::Funding;
        Ok(())
    }

    /// `Funding -> Acting`.
    pub fn set_funded(&mut self) -> Result<(), MachineError> {
        self.expect_phase(Phase::Funding, "set_funded")?;
        self.phase = Phase::Acting;
        Ok(())
    }

    /// Stages a regular update. Sub-allocations must be untouched; the
    /// virtual funding and settlement paths use [Self::update_funding].
    pub fn update(&mut self, state: State, actor: PartIdx) -> Result<(), MachineError> {
        self.stage_update(state, actor, false)
    }

    /// Stages an update that may add or remove sub-allocations.
    pub fn update_funding(&mut self, state: State, actor: PartIdx) -> Result<(), MachineError> {
        self.stage_update(state, actor, true)
    }

    fn stage_update(
        &mut self,
        state: State,
        actor: PartIdx,
        allow_sub_alloc_change: bool,
    ) -> Result<(), MachineError> {
        if self.phase == Phase::Final {
            return Err(MachineError::AlreadyFinal);
        }
        self.expect_phase(Phase::Acting, "update")?;
        if self.staged.is_some() {
            return Err(MachineError::StagedUpdateInProgress);
        }
        self.validate_update(&state, actor, allow_sub_alloc_change)?;
        let num_parts = self.params.num_parts();
        self.staged = Some(StagedUpdate {
            tx: Transaction::new(state, num_parts),
            actor,
        });
        self.phase = Phase::Signing;
        Ok(())
    }

    /// Validates an incoming update and its proposer signature without
    /// staging anything.
    pub fn check_update(
        &self,
        state: &State,
        actor: PartIdx,
        sig: &Signature,
        sig_idx: PartIdx,
    ) -> Result<(), MachineError> {
        self.validate_update(state, actor, false)?;
        if (sig_idx as usize) >= self.params.num_parts() {
            return Err(MachineError::InvalidActor(sig_idx));
        }
        let hash = state_hash(&self.params, state)?;
        if !wallet::verify(hash, self.params.participants[sig_idx as usize], sig) {
            return Err(MachineError::BadSignature(sig_idx));
        }
        Ok(())
    }

    fn validate_update(
        &self,
        state: &State,
        actor: PartIdx,
        allow_sub_alloc_change: bool,
    ) -> Result<(), MachineError> {
        if self.phase == Phase::Final {
            return Err(MachineError::AlreadyFinal);
        }
        if (actor as usize) >= self.params.num_parts() {
            return Err(MachineError::InvalidActor(actor));
        }
        let curr = self.state()?;
        if state.channel_id != curr.channel_id {
            return Err(MachineError::IdMismatch);
        }
        if state.version != curr.version + 1 {
            return Err(MachineError::VersionMismatch {
                expected: curr.version + 1,
                got: state.version,
            });
        }
        state.allocation.validate()?;
        curr.allocation.assert_equal_sum(&state.allocation)?;
        if !allow_sub_alloc_change
            && !sub_allocs_equal(&curr.allocation.locked, &state.allocation.locked)
        {
            return Err(MachineError::SubAllocChanged);
        }
        Ok(())
    }

    /// Promotes the staged update to current. `Signing -> Acting`.
    pub fn enable_update(&mut self) -> Result<(), MachineError> {
        self.expect_phase(Phase::Signing, "enable_update")?;
        self.promote_staged()?;
        self.phase = Phase::Acting;
        Ok(())
    }

    /// Promotes a staged final state. The machine refuses any further
    /// updates afterwards.
    pub fn enable_final(&mut self) -> Result<(), MachineError> {
        self.expect_phase(Phase::Signing, "enable_final")?;
        match self.staging_state() {
            Some(state) if state.is_final => {}
            Some(_) => {
                return Err(MachineError::InvalidPhase {
                    phase: self.phase,
                    op: "enable_final on non-final state",
                })
            }
            None => return Err(MachineError::NoStagedUpdate),
        }
        self.promote_staged()?;
        self.phase = Phase::Final;
        Ok(())
    }

    fn promote_staged(&mut self) -> Result<(), MachineError> {
        let staged = self.staged.as_ref().ok_or(MachineError::NoStagedUpdate)?;
        if let Some(missing) = staged.tx.missing_sig() {
            return Err(MachineError::SignaturesIncomplete { missing });
        }
        self.curr = Some(self.staged.take().unwrap().tx);
        Ok(())
    }

    /// Drops the staged update, if any. Idempotent; promoted data is
    /// untouchable.
    pub fn discard_update(&mut self) -> Result<(), MachineError> {
        if self.staged.take().is_some() && self.phase == Phase::Signing {
            self.phase = Phase::Acting;
        }
        Ok(())
    }

    /// Adopts a fully-signed final state wholesale, skipping the staging
    /// round-trip. Used for counterparty copies whose owner was not part of
    /// the update exchange (the intermediary's view of a virtual channel).
    pub fn adopt_final(&mut self, state: State, sigs: Vec<Signature>) -> Result<(), MachineError> {
        if state.channel_id != self.params.id() {
            return Err(MachineError::IdMismatch);
        }
        if !state.is_final {
            return Err(MachineError::InvalidPhase {
                phase: self.phase,
                op: "adopt_final on non-final state",
            });
        }
        if sigs.len() != self.params.num_parts() {
            return Err(MachineError::SignaturesIncomplete {
                missing: sigs.len() as PartIdx,
            });
        }
        let hash = state_hash(&self.params, &state)?;
        for (i, sig) in sigs.iter().enumerate() {
            if !wallet::verify(hash, self.params.participants[i], sig) {
                return Err(MachineError::BadSignature(i as PartIdx));
            }
        }
        self.staged = None;
        self.curr = Some(Transaction {
            state,
            sigs: sigs.into_iter().map(Some).collect(),
        });
        self.phase = Phase::Final;
        Ok(())
    }

    /// Drives the machine into a dispute or withdrawal phase. A pending
    /// staged update is cleared; it can no longer complete once the channel
    /// is contested on-chain.
    pub fn set_phase(&mut self, to: Phase) -> Result<(), MachineError> {
        if !phase_transition_allowed(self.phase, to) {
            return Err(MachineError::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.staged = None;
        self.phase = to;
        Ok(())
    }

    /// Replaces the current state with a forced progression of our own.
    /// `Registered/Progressed -> Progressing`.
    pub fn set_progressing(&mut self, state: State) -> Result<(), MachineError> {
        self.set_phase(Phase::Progressing)?;
        let num_parts = self.params.num_parts();
        self.curr = Some(Transaction::new(state, num_parts));
        Ok(())
    }

    /// Adopts a state progression observed on-chain.
    pub fn set_progressed(&mut self, state: State) -> Result<(), MachineError> {
        self.set_phase(Phase::Progressed)?;
        let num_parts = self.params.num_parts();
        self.curr = Some(Transaction::new(state, num_parts));
        Ok(())
    }

    fn expect_phase(&self, phase: Phase, op: &'static str) -> Result<(), MachineError> {
        if self.phase != phase {
            return Err(MachineError::InvalidPhase {
                phase: self.phase,
                op,
            });
        }
        Ok(())
    }
}

fn phase_transition_allowed(from: Phase, to: Phase) -> bool {
    use Phase::*;
    match to {
        // Any live phase can be pushed into a dispute; a refutation
        // re-registers from Registered.
        Registering => matches!(
            from,
            InitSigning | Funding | Acting | Signing | Final | Registered | Progressed
        ),
        Registered => matches!(
            from,
            Registering | Acting | Signing | Final | Progressed | Registered
        ),
        Progressing => matches!(from, Registered | Progressed),
        // The event stream keeps only the latest meaningful event per
        // backend, so a Progressed event may be the first one a live
        // machine observes.
        Progressed => matches!(
            from,
            Registered | Progressing | Progressed | Acting | Signing | Final
        ),
        Withdrawing => matches!(from, Acting | Final | Registered | Progressed),
        Withdrawn => matches!(from, Withdrawing),
        _ => false,
    }
}
