//! Per-phase agent scheduling.
//!
//! Sequential phases run agents one at a time in configured order and stop at
//! the first failing required agent. Parallel phases start every agent on a
//! worker pool bounded by `max_parallel_agents` and wait for all of them.
//! Either way the outcomes come back in configured order.

use crate::agent::{AgentInvoker, AgentOutcome, PhaseContext};
use crate::phase::PhaseDefinition;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Runs the agents of one phase attempt.
#[derive(Debug, Clone)]
pub struct PhaseExecutor {
    invoker: AgentInvoker,
    max_parallel: usize,
}

impl PhaseExecutor {
    pub fn new(invoker: AgentInvoker, max_parallel: usize) -> Self {
        Self {
            invoker,
            max_parallel: max_parallel.max(1),
        }
    }

    pub fn invoker(&self) -> &AgentInvoker {
        &self.invoker
    }

    pub async fn run(&self, phase: &PhaseDefinition, context: &PhaseContext) -> Vec<AgentOutcome> {
        if phase.parallel && phase.agents.len() > 1 {
            self.run_parallel(phase, context).await
        } else {
            self.run_sequential(phase, context).await
        }
    }

    async fn run_sequential(
        &self,
        phase: &PhaseDefinition,
        context: &PhaseContext,
    ) -> Vec<AgentOutcome> {
        let mut outcomes = Vec::with_capacity(phase.agents.len());
        for (index, agent) in phase.agents.iter().enumerate() {
            let outcome = self.invoker.invoke(agent, context).await;
            let stop = !outcome.success && self.invoker.is_required(agent);
            outcomes.push(outcome);
            if stop {
                let skipped = &phase.agents[index + 1..];
                if !skipped.is_empty() {
                    tracing::info!(
                        phase = %phase.name,
                        agent = %agent,
                        skipped = ?skipped,
                        "required agent failed, skipping remaining agents"
                    );
                }
                break;
            }
        }
        outcomes
    }

    async fn run_parallel(
        &self,
        phase: &PhaseDefinition,
        context: &PhaseContext,
    ) -> Vec<AgentOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.max_parallel));
        tracing::debug!(
            phase = %phase.name,
            agents = phase.agents.len(),
            max_parallel = self.max_parallel,
            "dispatching agents in parallel"
        );

        let handles: Vec<_> = phase
            .agents
            .iter()
            .map(|agent| {
                let semaphore = semaphore.clone();
                let invoker = self.invoker.clone();
                let context = context.clone();
                let agent = agent.clone();
                tokio::spawn(async move {
                    // The semaphore is never closed, so acquiring only fails if it were.
                    let _permit = semaphore.acquire_owned().await.ok();
                    invoker.invoke(&agent, &context).await
                })
            })
            .collect();

        join_all(handles)
            .await
            .into_iter()
            .zip(phase.agents.iter())
            .map(|(joined, agent)| match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::warn!(agent = %agent, error = %e, "agent task did not complete");
                    AgentOutcome::failed(agent, format!("Agent task failed: {}", e), Duration::ZERO)
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentConfig, AgentStrategy, DelegatedAgent, StubAgent};
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::path::Path;
    use tempfile::tempdir;

    fn context(dir: &Path) -> PhaseContext {
        PhaseContext::build(
            "run-1",
            "build",
            "",
            dir.to_path_buf(),
            &json!({}),
            &[],
            &BTreeMap::new(),
            &BTreeMap::new(),
        )
    }

    fn executor(entries: Vec<(&str, AgentConfig)>, max_parallel: usize) -> PhaseExecutor {
        let agents = entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        PhaseExecutor::new(AgentInvoker::new(agents), max_parallel)
    }

    fn failing() -> AgentConfig {
        AgentConfig::new(AgentStrategy::Stub(StubAgent::failing("boom")))
    }

    #[tokio::test]
    async fn test_sequential_stops_at_first_required_failure() {
        let dir = tempdir().unwrap();
        let exec = executor(
            vec![("a", AgentConfig::stub()), ("b", failing()), ("c", AgentConfig::stub())],
            4,
        );
        let phase = PhaseDefinition::new("build", &["a", "b", "c"]);
        let outcomes = exec.run(&phase, &context(dir.path())).await;
        let names: Vec<_> = outcomes.iter().map(|o| o.agent_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(!outcomes[1].success);
    }

    #[tokio::test]
    async fn test_sequential_continues_past_optional_failure() {
        let dir = tempdir().unwrap();
        let exec = executor(
            vec![("a", failing().optional()), ("b", AgentConfig::stub())],
            4,
        );
        let phase = PhaseDefinition::new("build", &["a", "b"]);
        let outcomes = exec.run(&phase, &context(dir.path())).await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[1].success);
    }

    #[tokio::test]
    async fn test_parallel_runs_every_agent_in_configured_order() {
        let dir = tempdir().unwrap();
        let exec = executor(
            vec![("a", failing()), ("b", AgentConfig::stub()), ("c", AgentConfig::stub())],
            2,
        );
        let phase = PhaseDefinition::new("build", &["c", "a", "b"]).with_parallel();
        let outcomes = exec.run(&phase, &context(dir.path())).await;
        let names: Vec<_> = outcomes.iter().map(|o| o.agent_name.as_str()).collect();
        assert_eq!(names, vec!["c", "a", "b"]);
        assert!(!outcomes[1].success);
    }

    #[tokio::test]
    async fn test_parallel_respects_pool_size() {
        let dir = tempdir().unwrap();
        // Each agent records the number of concurrently running agents it observes.
        let script = "mkdir -p running; touch running/$WAYPOINT_AGENT; sleep 0.3; ls running | wc -l >> peaks.txt; rm running/$WAYPOINT_AGENT";
        let agent = || AgentConfig::new(AgentStrategy::Delegated(DelegatedAgent::shell(script)));
        let exec = executor(
            vec![("a", agent()), ("b", agent()), ("c", agent()), ("d", agent())],
            2,
        );
        let phase = PhaseDefinition::new("build", &["a", "b", "c", "d"]).with_parallel();
        let outcomes = exec.run(&phase, &context(dir.path())).await;
        assert!(outcomes.iter().all(|o| o.success));

        let peaks = std::fs::read_to_string(dir.path().join("peaks.txt")).unwrap();
        let max = peaks
            .lines()
            .filter_map(|l| l.trim().parse::<usize>().ok())
            .max()
            .unwrap();
        assert!(max <= 2, "observed {} concurrent agents", max);
    }
}
