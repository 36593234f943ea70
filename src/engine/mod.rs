//! Workflow engine.
//!
//! `WorkflowEngine` owns one `RunState` and is the only writer of it. Each
//! operation validates the current status, applies its transition and
//! persists the whole state before returning.
//!
//! ```text
//! Idle -> Running -> { NeedsRevision <-> Running } -> AwaitingConsensus
//!      -> { Running | NeedsRevision } -> ... -> Completed
//!
//! Running | NeedsRevision | AwaitingConsensus -> Aborted -> (resume) -> previous status
//! ```

pub mod executor;
pub mod state;

use crate::agent::{AgentInvoker, AgentOutcome, PhaseContext};
use crate::checkpoint::{self, ValidationResult, ValidationStatus};
use crate::config::Config;
use crate::consensus::{ConsensusDecision, ConsensusGate, ConsensusStore};
use crate::errors::EngineError;
use crate::phase::{PhaseDefinition, PhasePlan};
use executor::PhaseExecutor;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use state::{PhaseFailure, RunState, RunStatus, StateStore, keys};
use std::path::PathBuf;

/// Result of one phase attempt. Only its effects are persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub phase_name: String,
    pub agent_outcomes: Vec<AgentOutcome>,
    pub validation: Option<ValidationResult>,
    pub success: bool,
    pub awaiting_consensus: bool,
}

impl PhaseOutcome {
    /// Errors of agents that failed during this attempt.
    pub fn agent_errors(&self) -> Vec<String> {
        self.agent_outcomes
            .iter()
            .filter(|o| !o.success)
            .map(|o| {
                format!(
                    "{}: {}",
                    o.agent_name,
                    o.error.as_deref().unwrap_or("failed without an error message")
                )
            })
            .collect()
    }
}

/// Phase state machine over one persisted run.
#[derive(Debug)]
pub struct WorkflowEngine {
    project_dir: PathBuf,
    plan: PhasePlan,
    accept_partial: bool,
    store: StateStore,
    executor: PhaseExecutor,
    gate: ConsensusGate,
    state: RunState,
}

impl WorkflowEngine {
    /// Create and persist a new run positioned at the first enabled phase.
    ///
    /// Nothing is written when the workflow is malformed.
    pub fn start(config: &Config, intake: Value) -> Result<Self, EngineError> {
        config.workflow.validate()?;

        let mut state = RunState::new(intake);
        let plan = config.workflow.plan();
        let first = plan
            .first()
            .map(|p| p.name.clone())
            .ok_or(EngineError::EmptyPhaseGraph)?;
        state.current_phase = Some(first.clone());
        state.status = RunStatus::Running;

        let mut engine = Self::assemble(config, plan, state);
        engine.persist()?;
        config.set_current_run(&engine.state.run_id)?;

        tracing::info!(
            run_id = %engine.state.run_id,
            phase = %first,
            phases = engine.plan.len(),
            "run started"
        );
        Ok(engine)
    }

    /// Rebuild an engine over a persisted run.
    pub fn load(config: &Config, run_id: &str) -> Result<Self, EngineError> {
        config.workflow.validate()?;
        let store = config.state_store();
        let state = store.load(run_id)?;
        let plan = config.workflow.plan();
        let mut engine = Self::assemble(config, plan, state);

        if engine.rederive_current_phase() {
            engine.persist()?;
        }
        tracing::debug!(run_id, status = %engine.state.status, "run loaded");
        Ok(engine)
    }

    fn assemble(config: &Config, plan: PhasePlan, state: RunState) -> Self {
        let store = config.state_store();
        let invoker = AgentInvoker::new(config.workflow.agents.clone())
            .with_run_dir(store.run_dir(&state.run_id));
        Self {
            project_dir: config.project_dir.clone(),
            plan,
            accept_partial: config.workflow.engine.accept_partial,
            executor: PhaseExecutor::new(invoker, config.workflow.engine.max_parallel_agents),
            store,
            gate: ConsensusGate,
            state,
        }
    }

    /// Point `current_phase` back into the plan if the workflow changed under
    /// a persisted run. Returns whether anything changed.
    fn rederive_current_phase(&mut self) -> bool {
        let active = matches!(
            self.effective_status(),
            RunStatus::Running | RunStatus::NeedsRevision
        );
        let stale = match &self.state.current_phase {
            Some(name) => !self.plan.contains(name),
            None => active,
        };
        if !active || !stale {
            return false;
        }

        let next = self
            .plan
            .next_pending(&self.state.completed_phases)
            .map(|p| p.name.clone());
        tracing::warn!(
            run_id = %self.state.run_id,
            from = ?self.state.current_phase,
            to = ?next,
            "current phase is no longer enabled, re-deriving"
        );
        self.state.current_phase = next;
        if self.state.current_phase.is_none() {
            self.set_status(RunStatus::Completed);
        }
        true
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn run_id(&self) -> &str {
        &self.state.run_id
    }

    pub fn plan(&self) -> &PhasePlan {
        &self.plan
    }

    pub fn run_dir(&self) -> PathBuf {
        self.store.run_dir(&self.state.run_id)
    }

    pub fn consensus_store(&self) -> ConsensusStore {
        ConsensusStore::new(self.run_dir().join("consensus"))
    }

    fn reports_dir(&self) -> PathBuf {
        self.run_dir().join("reports")
    }

    /// Diagnostics for the most recent failed attempt or rejection.
    pub fn failure(&self) -> Option<PhaseFailure> {
        self.state.last_failure()
    }

    /// Execute the current phase and apply the resulting transition.
    pub async fn advance(&mut self) -> Result<PhaseOutcome, EngineError> {
        self.observe_external_abort();
        let status = self.state.status;
        if !status.can_advance() {
            return Err(EngineError::InvalidState {
                operation: "advance",
                status,
            });
        }

        let phase = match self.state.current_phase.clone() {
            Some(name) => self
                .plan
                .get(&name)
                .cloned()
                .ok_or(EngineError::UnknownPhase(name))?,
            None => {
                // Nothing left: the run should already have been completed.
                self.state.status = RunStatus::Completed;
                self.persist()?;
                return Err(EngineError::InvalidState {
                    operation: "advance",
                    status: RunStatus::Completed,
                });
            }
        };

        let attempt = self.state.bump_attempts(&phase.name);
        tracing::info!(
            run_id = %self.state.run_id,
            phase = %phase.name,
            attempt,
            agents = phase.agents.len(),
            parallel = phase.parallel,
            "executing phase"
        );

        let context = PhaseContext::build(
            &self.state.run_id,
            &phase.name,
            "",
            self.project_dir.clone(),
            &self.state.intake_summary,
            &self.state.completed_phases,
            &self.state.phase_artifacts,
            &phase.context,
        );
        let agent_outcomes = self.executor.run(&phase, &context).await;
        let validation = self.validate_phase(&phase);
        let outcome = self.evaluate(&phase, agent_outcomes, validation);

        self.apply_outcome(&phase, &outcome, attempt)?;
        self.persist()?;
        Ok(outcome)
    }

    fn validate_phase(&self, phase: &PhaseDefinition) -> Option<ValidationResult> {
        if phase.artifacts_required.is_empty() {
            return None;
        }
        let mut result = checkpoint::validate(&phase.artifacts_required, &self.project_dir);
        if let Err(e) = checkpoint::write_report(&phase.name, &mut result, &self.reports_dir()) {
            tracing::warn!(phase = %phase.name, error = %e, "failed to write checkpoint report");
        }
        tracing::info!(
            phase = %phase.name,
            status = %result.status,
            missing = result.missing.len(),
            "checkpoint evaluated"
        );
        Some(result)
    }

    fn evaluate(
        &self,
        phase: &PhaseDefinition,
        agent_outcomes: Vec<AgentOutcome>,
        validation: Option<ValidationResult>,
    ) -> PhaseOutcome {
        let invoker = self.executor.invoker();
        let required_failed = agent_outcomes
            .iter()
            .any(|o| !o.success && invoker.is_required(&o.agent_name));
        let validation_ok = match &validation {
            None => true,
            Some(v) => match v.status {
                ValidationStatus::Pass => true,
                ValidationStatus::Partial => self.accept_partial,
                ValidationStatus::Fail => false,
            },
        };
        let success = !required_failed && validation_ok;

        PhaseOutcome {
            phase_name: phase.name.clone(),
            agent_outcomes,
            validation,
            success,
            awaiting_consensus: success && phase.requires_consensus,
        }
    }

    fn apply_outcome(
        &mut self,
        phase: &PhaseDefinition,
        outcome: &PhaseOutcome,
        attempt: u32,
    ) -> Result<(), EngineError> {
        let invoker = self.executor.invoker();
        for failed in outcome
            .agent_outcomes
            .iter()
            .filter(|o| !o.success && !invoker.is_required(&o.agent_name))
        {
            self.state.errors.push(format!(
                "Phase '{}' attempt {}: optional agent {} failed: {}",
                phase.name,
                attempt,
                failed.agent_name,
                failed.error.as_deref().unwrap_or("unknown error")
            ));
        }

        if !outcome.success {
            let failure = PhaseFailure {
                phase: phase.name.clone(),
                agent_errors: outcome.agent_errors(),
                validation_status: outcome.validation.as_ref().map(|v| v.status),
                report_path: outcome
                    .validation
                    .as_ref()
                    .and_then(|v| v.report_path.clone()),
                rejection: None,
            };
            let mut reasons = failure.agent_errors.clone();
            if let Some(v) = &outcome.validation
                && !v.missing.is_empty()
            {
                reasons.push(format!("missing artifacts: {}", v.missing.join(", ")));
            }
            self.state.errors.push(format!(
                "Phase '{}' attempt {} failed: {}",
                phase.name,
                attempt,
                reasons.join("; ")
            ));
            self.state.set_meta(keys::LAST_FAILURE, &failure);
            self.set_status(RunStatus::NeedsRevision);
            tracing::warn!(
                run_id = %self.state.run_id,
                phase = %phase.name,
                attempt,
                "phase failed, run needs revision"
            );
            return Ok(());
        }

        self.state.clear_meta(keys::LAST_FAILURE);
        let artifacts = collect_artifacts(outcome);

        if phase.requires_consensus {
            let request = self
                .gate
                .request(&self.state.run_id, outcome, &artifacts);
            let path = self.consensus_store().record_request(&request)?;
            self.state.set_meta(keys::PENDING_ARTIFACTS, &artifacts);
            self.state.awaiting_consensus = true;
            self.state.consensus_phase = Some(phase.name.clone());
            self.set_status(RunStatus::AwaitingConsensus);
            tracing::info!(
                run_id = %self.state.run_id,
                phase = %phase.name,
                request = %path.display(),
                "phase awaiting consensus"
            );
        } else {
            self.complete_phase(&phase.name, artifacts);
        }
        Ok(())
    }

    /// Record `phase` as done and move to the next pending phase.
    fn complete_phase(&mut self, phase: &str, artifacts: Vec<String>) {
        if !self.state.is_completed(phase) {
            self.state.completed_phases.push(phase.to_string());
        }
        self.state
            .phase_artifacts
            .entry(phase.to_string())
            .or_insert(artifacts);

        let next = self
            .plan
            .next_pending(&self.state.completed_phases)
            .map(|p| p.name.clone());
        self.state.current_phase = next.clone();
        match next {
            Some(next) => {
                self.set_status(RunStatus::Running);
                tracing::info!(run_id = %self.state.run_id, phase, next = %next, "phase completed");
            }
            None => {
                self.set_status(RunStatus::Completed);
                tracing::info!(run_id = %self.state.run_id, phase, "run completed");
            }
        }
    }

    /// Status changes that land while the run is aborted are deferred to `resume`.
    fn set_status(&mut self, status: RunStatus) {
        if self.state.status == RunStatus::Aborted {
            self.state.set_meta(keys::PRE_ABORT_STATUS, &status);
        } else {
            self.state.status = status;
        }
    }

    /// Status the run will have once any abort is resumed.
    fn effective_status(&self) -> RunStatus {
        match self.state.status {
            RunStatus::Aborted => self.state.pre_abort_status().unwrap_or(RunStatus::Running),
            status => status,
        }
    }

    /// Pick up an abort written by another process since this engine last
    /// read or wrote the run. `abort` does not take the run lock, so it may
    /// land while a phase is executing.
    fn observe_external_abort(&mut self) {
        if self.state.status == RunStatus::Aborted || !self.store.exists(&self.state.run_id) {
            return;
        }
        let persisted = match self.store.load(&self.state.run_id) {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::warn!(run_id = %self.state.run_id, error = %e, "could not re-read run state");
                return;
            }
        };
        if persisted.updated_at == self.state.updated_at || persisted.status != RunStatus::Aborted {
            return;
        }
        tracing::info!(
            run_id = %self.state.run_id,
            deferred_status = %self.state.status,
            "run was aborted by another process, keeping it aborted"
        );
        let status = self.state.status;
        self.state.set_meta(keys::PRE_ABORT_STATUS, &status);
        self.state.status = RunStatus::Aborted;
    }

    /// Approve the phase awaiting consensus and move on.
    ///
    /// The state is persisted before the decision record is written, so a
    /// failed write never leaves a decision for a run still at the gate.
    pub fn approve(&mut self) -> Result<ConsensusDecision, EngineError> {
        self.observe_external_abort();
        let phase = self.gated_phase("approve")?;
        let decision = self.gate.decide(&self.state.run_id, &phase, true, None);

        let artifacts = self.state.pending_artifacts();
        self.clear_gate();
        self.complete_phase(&phase, artifacts);
        self.persist()?;
        self.consensus_store().record_decision(&decision)?;
        tracing::info!(run_id = %self.state.run_id, phase = %phase, "phase approved");
        Ok(decision)
    }

    /// Reject the phase awaiting consensus; it will be retried by `advance`.
    pub fn reject(&mut self, reason: &str) -> Result<ConsensusDecision, EngineError> {
        self.observe_external_abort();
        let phase = self.gated_phase("reject")?;
        let decision = self
            .gate
            .decide(&self.state.run_id, &phase, false, Some(reason));

        self.clear_gate();
        let failure = PhaseFailure {
            phase: phase.clone(),
            agent_errors: Vec::new(),
            validation_status: None,
            report_path: None,
            rejection: decision.reason.clone(),
        };
        self.state.set_meta(keys::LAST_FAILURE, &failure);
        self.state.errors.push(format!(
            "Phase '{}' rejected: {}",
            phase,
            decision.reason.as_deref().unwrap_or("no reason given")
        ));
        self.set_status(RunStatus::NeedsRevision);
        self.persist()?;
        self.consensus_store().record_decision(&decision)?;
        tracing::info!(run_id = %self.state.run_id, phase = %phase, "phase rejected");
        Ok(decision)
    }

    fn gated_phase(&self, operation: &'static str) -> Result<String, EngineError> {
        let status = self.state.status;
        if status != RunStatus::AwaitingConsensus {
            return Err(EngineError::InvalidState { operation, status });
        }
        self.state
            .consensus_phase
            .clone()
            .or_else(|| self.state.current_phase.clone())
            .ok_or(EngineError::InvalidState { operation, status })
    }

    fn clear_gate(&mut self) {
        self.state.awaiting_consensus = false;
        self.state.consensus_phase = None;
        self.state.clear_meta(keys::PENDING_ARTIFACTS);
    }

    /// Suspend the run; aborting twice is a no-op.
    ///
    /// Applied to the state as persisted, not this engine's copy: only
    /// `status` and the pre-abort status change, so progress saved by another
    /// writer since this engine loaded the run is kept.
    pub fn abort(&mut self) -> Result<(), EngineError> {
        let _guard = self.store.write_lock(&self.state.run_id)?;
        if self.store.exists(&self.state.run_id) {
            self.state = self.store.load(&self.state.run_id)?;
        }

        let status = self.state.status;
        if status == RunStatus::Aborted {
            return Ok(());
        }
        if status.is_terminal() {
            return Err(EngineError::InvalidState {
                operation: "abort",
                status,
            });
        }
        self.state.set_meta(keys::PRE_ABORT_STATUS, &status);
        self.state.status = RunStatus::Aborted;
        self.store.save(&mut self.state)?;
        tracing::info!(run_id = %self.state.run_id, previous = %status, "run aborted");
        Ok(())
    }

    /// Restore the status the run had when it was aborted.
    pub fn resume(&mut self) -> Result<RunStatus, EngineError> {
        self.observe_external_abort();
        let status = self.state.status;
        if status != RunStatus::Aborted {
            return Err(EngineError::InvalidState {
                operation: "resume",
                status,
            });
        }
        let restored = self.state.pre_abort_status().unwrap_or(RunStatus::Running);
        self.state.status = restored;
        self.state.clear_meta(keys::PRE_ABORT_STATUS);
        self.persist()?;
        tracing::info!(run_id = %self.state.run_id, status = %restored, "run resumed");
        Ok(restored)
    }

    /// Administrative override: make `phase` the current phase.
    ///
    /// Clears any pending consensus and sets the run `Running`. Completed
    /// phases stay recorded.
    pub fn jump(&mut self, phase: &str) -> Result<(), EngineError> {
        self.observe_external_abort();
        let status = self.state.status;
        if status == RunStatus::Aborted {
            return Err(EngineError::InvalidState {
                operation: "jump",
                status,
            });
        }
        if !self.plan.contains(phase) {
            return Err(EngineError::UnknownPhase(phase.to_string()));
        }

        self.clear_gate();
        self.state.current_phase = Some(phase.to_string());
        self.state.status = RunStatus::Running;
        self.state
            .errors
            .push(format!("Jumped to phase '{}' from status {}", phase, status));
        self.persist()?;
        tracing::warn!(run_id = %self.state.run_id, phase, from = %status, "jumped to phase");
        Ok(())
    }

    /// Advance until the run completes, waits for consensus or needs revision.
    pub async fn run_until_blocked(&mut self) -> Result<Vec<PhaseOutcome>, EngineError> {
        let mut outcomes = Vec::new();
        while self.state.status.can_advance() {
            let outcome = self.advance().await?;
            let failed = !outcome.success;
            outcomes.push(outcome);
            if failed {
                break;
            }
        }
        Ok(outcomes)
    }

    /// Replace the persisted state, keeping any abort another process wrote
    /// in the meantime.
    fn persist(&mut self) -> Result<(), EngineError> {
        let _guard = self.store.write_lock(&self.state.run_id)?;
        self.observe_external_abort();
        self.store.save(&mut self.state)?;
        Ok(())
    }
}

/// Union of agent-declared artifacts and checkpoint matches, sorted.
fn collect_artifacts(outcome: &PhaseOutcome) -> Vec<String> {
    let mut artifacts: Vec<String> = outcome
        .agent_outcomes
        .iter()
        .flat_map(|o| o.artifacts.iter().cloned())
        .chain(
            outcome
                .validation
                .iter()
                .flat_map(|v| v.found.iter().cloned()),
        )
        .collect();
    artifacts.sort();
    artifacts.dedup();
    artifacts
}
