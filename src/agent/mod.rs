//! Agent invocation.
//!
//! Every agent is executed through exactly one `AgentStrategy`, resolved once
//! from the workflow file:
//!
//! | Strategy    | Behaviour                                                        |
//! |-------------|------------------------------------------------------------------|
//! | `delegated` | spawn an external command under the retry policy                 |
//! | `deferred`  | emit instructions for an external actor, return a placeholder    |
//! | `stub`      | return a canned outcome, no side effects                         |
//!
//! All three produce the same `AgentOutcome`. Failures are captured in the
//! outcome, never returned as errors.

pub mod context;
pub mod deferred;
pub mod retry;
pub mod subprocess;

pub use context::PhaseContext;
pub use deferred::DeferredAgent;
pub use retry::{Classification, RetryPolicy, backoff_delay};
pub use subprocess::DelegatedAgent;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Uniform result of one agent invocation within one phase attempt.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentOutcome {
    pub agent_name: String,
    pub success: bool,
    /// Paths the agent reports having produced, relative to the project dir
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration: Duration,
    /// Attempts made (delegated agents may retry)
    #[serde(default = "one")]
    pub attempts: u32,
    /// Work was handed to an external actor and is verified only by the checkpoint
    #[serde(default)]
    pub awaiting_external: bool,
}

fn one() -> u32 {
    1
}

impl AgentOutcome {
    pub fn succeeded(agent: &str, artifacts: Vec<String>, notes: String, duration: Duration) -> Self {
        Self {
            agent_name: agent.to_string(),
            success: true,
            artifacts,
            notes,
            error: None,
            duration,
            attempts: 1,
            awaiting_external: false,
        }
    }

    pub fn failed(agent: &str, error: String, duration: Duration) -> Self {
        Self {
            agent_name: agent.to_string(),
            success: false,
            artifacts: Vec::new(),
            notes: String::new(),
            error: Some(error),
            duration,
            attempts: 1,
            awaiting_external: false,
        }
    }
}

/// Canned outcome for testing the engine without side effects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StubAgent {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for StubAgent {
    fn default() -> Self {
        Self {
            success: true,
            artifacts: Vec::new(),
            notes: String::new(),
            error: None,
        }
    }
}

impl StubAgent {
    pub fn failing(error: &str) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// How an agent's work is carried out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy", rename_all = "lowercase")]
pub enum AgentStrategy {
    Delegated(DelegatedAgent),
    Deferred(DeferredAgent),
    Stub(StubAgent),
}

impl AgentStrategy {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentStrategy::Delegated(_) => "delegated",
            AgentStrategy::Deferred(_) => "deferred",
            AgentStrategy::Stub(_) => "stub",
        }
    }
}

/// One `[agents.<name>]` entry of the workflow file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(flatten)]
    pub strategy: AgentStrategy,
    /// A failing required agent fails the phase; others are only logged
    #[serde(default = "default_true")]
    pub required: bool,
}

impl AgentConfig {
    pub fn new(strategy: AgentStrategy) -> Self {
        Self {
            strategy,
            required: true,
        }
    }

    pub fn stub() -> Self {
        Self::new(AgentStrategy::Stub(StubAgent::default()))
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Dispatches invocations to the configured strategy.
///
/// Cheap to clone; parallel phases hand a clone to each worker.
#[derive(Debug, Clone)]
pub struct AgentInvoker {
    agents: Arc<BTreeMap<String, AgentConfig>>,
    /// Run directory receiving `logs/` and `instructions/`
    run_dir: Option<PathBuf>,
}

impl AgentInvoker {
    pub fn new(agents: BTreeMap<String, AgentConfig>) -> Self {
        Self {
            agents: Arc::new(agents),
            run_dir: None,
        }
    }

    pub fn with_run_dir(mut self, run_dir: PathBuf) -> Self {
        self.run_dir = Some(run_dir);
        self
    }

    pub fn is_required(&self, agent: &str) -> bool {
        self.agents.get(agent).map(|a| a.required).unwrap_or(true)
    }

    /// Invoke `agent_id` with `context`.
    pub async fn invoke(&self, agent_id: &str, context: &PhaseContext) -> AgentOutcome {
        let start = Instant::now();
        let Some(config) = self.agents.get(agent_id) else {
            return AgentOutcome::failed(
                agent_id,
                format!("Agent '{}' is not configured", agent_id),
                start.elapsed(),
            );
        };

        let context = context.for_agent(agent_id);
        tracing::info!(
            agent = agent_id,
            phase = %context.phase,
            strategy = config.strategy.kind(),
            "invoking agent"
        );

        let outcome = match &config.strategy {
            AgentStrategy::Delegated(spec) => self.invoke_delegated(spec, &context, start).await,
            AgentStrategy::Deferred(spec) => self.invoke_deferred(spec, &context, start),
            AgentStrategy::Stub(spec) => invoke_stub(spec, agent_id, start),
        };

        if outcome.success {
            tracing::info!(
                agent = agent_id,
                attempts = outcome.attempts,
                artifacts = outcome.artifacts.len(),
                "agent finished"
            );
        } else {
            tracing::warn!(
                agent = agent_id,
                attempts = outcome.attempts,
                error = outcome.error.as_deref().unwrap_or(""),
                "agent failed"
            );
        }
        outcome
    }

    async fn invoke_delegated(
        &self,
        spec: &DelegatedAgent,
        context: &PhaseContext,
        start: Instant,
    ) -> AgentOutcome {
        let log_dir = self.run_dir.as_ref().map(|d| d.join("logs"));
        let log_dir = log_dir.as_deref();
        let retried = retry::run_with_retry(&spec.retry, &context.agent, |attempt| {
            subprocess::run_attempt(spec, context, attempt, log_dir)
        })
        .await;

        let mut outcome = match retried.result {
            Ok(output) => {
                let mut notes = subprocess::tail(output.stdout.trim(), 2000);
                if let Some(log) = &output.log_file {
                    if !notes.is_empty() {
                        notes.push('\n');
                    }
                    notes.push_str(&format!("log: {}", log.display()));
                }
                AgentOutcome::succeeded(&context.agent, output.artifacts, notes, start.elapsed())
            }
            Err(e) => {
                let error = if retried.attempts > 1 {
                    format!("{} (after {} attempts)", e, retried.attempts)
                } else {
                    e.to_string()
                };
                let mut outcome = AgentOutcome::failed(&context.agent, error, start.elapsed());
                if !retried.retried_errors.is_empty() {
                    outcome.notes = format!("retried: {}", retried.retried_errors.join("; "));
                }
                outcome
            }
        };
        outcome.attempts = retried.attempts;
        outcome
    }

    fn invoke_deferred(
        &self,
        spec: &DeferredAgent,
        context: &PhaseContext,
        start: Instant,
    ) -> AgentOutcome {
        let notes = match &self.run_dir {
            Some(dir) => match deferred::emit_instructions(spec, context, &dir.join("instructions")) {
                Ok(path) => format!("awaiting external completion; instructions: {}", path.display()),
                Err(e) => {
                    return AgentOutcome::failed(
                        &context.agent,
                        format!("{:#}", e),
                        start.elapsed(),
                    );
                }
            },
            None => {
                let doc = deferred::render_instructions(spec, context);
                format!("awaiting external completion\n{}", doc)
            }
        };

        let mut outcome =
            AgentOutcome::succeeded(&context.agent, Vec::new(), notes, start.elapsed());
        outcome.awaiting_external = true;
        outcome
    }
}

fn invoke_stub(spec: &StubAgent, agent: &str, start: Instant) -> AgentOutcome {
    if spec.success {
        AgentOutcome::succeeded(agent, spec.artifacts.clone(), spec.notes.clone(), start.elapsed())
    } else {
        let mut outcome = AgentOutcome::failed(
            agent,
            spec.error
                .clone()
                .unwrap_or_else(|| format!("Stub agent '{}' configured to fail", agent)),
            start.elapsed(),
        );
        outcome.notes = spec.notes.clone();
        outcome.artifacts = spec.artifacts.clone();
        outcome
    }
}
