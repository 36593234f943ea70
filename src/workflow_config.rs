//! Workflow file loading and validation.
//!
//! The workflow file describes the phases in execution order, the agents
//! they use, and engine-wide settings. TOML is the default format; JSON and
//! YAML are accepted based on the file extension.
//!
//! ```toml
//! [engine]
//! max_parallel_agents = 4
//!
//! [[phases]]
//! name = "ingest"
//! agents = ["loader"]
//! artifacts_required = ["data/*.csv"]
//!
//! [agents.loader]
//! strategy = "delegated"
//! command = "sh"
//! args = ["-c", "scripts/load.sh"]
//! ```

use crate::agent::AgentConfig;
use crate::errors::EngineError;
use crate::phase::{PhaseDefinition, PhasePlan};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Default workflow file name inside `.waypoint/`.
pub const WORKFLOW_FILE: &str = "workflow.toml";

/// Engine-wide settings from the `[engine]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineSettings {
    /// Worker pool size for parallel phases
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    /// Count a `partial` checkpoint as success
    #[serde(default)]
    pub accept_partial: bool,
    /// Drop phases marked `optional`
    #[serde(default)]
    pub skip_optional: bool,
    /// Run state directory, relative to the project directory
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
}

fn default_max_parallel_agents() -> usize {
    4
}

fn default_state_dir() -> String {
    ".waypoint/runs".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_parallel_agents: default_max_parallel_agents(),
            accept_partial: false,
            skip_optional: false,
            state_dir: default_state_dir(),
        }
    }
}

/// A complete workflow description.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub phases: Vec<PhaseDefinition>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentConfig>,
}

/// Serialization format of a workflow file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowFormat {
    Toml,
    Json,
    Yaml,
}

impl WorkflowFormat {
    /// Pick the format from the file extension, defaulting to TOML.
    pub fn from_path(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("json") => WorkflowFormat::Json,
            Some("yaml") | Some("yml") => WorkflowFormat::Yaml,
            _ => WorkflowFormat::Toml,
        }
    }
}

impl WorkflowConfig {
    /// Load a workflow file. Structural checks are left to `validate`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file: {}", path.display()))?;
        Self::parse(&content, WorkflowFormat::from_path(path))
            .with_context(|| format!("Failed to parse workflow file: {}", path.display()))
    }

    pub fn parse(content: &str, format: WorkflowFormat) -> Result<Self> {
        let config = match format {
            WorkflowFormat::Toml => toml::from_str(content).context("Invalid TOML workflow")?,
            WorkflowFormat::Json => serde_json::from_str(content).context("Invalid JSON workflow")?,
            WorkflowFormat::Yaml => serde_yaml::from_str(content).context("Invalid YAML workflow")?,
        };
        Ok(config)
    }

    /// Enabled phases in execution order.
    pub fn plan(&self) -> PhasePlan {
        PhasePlan::from_definitions(&self.phases, self.engine.skip_optional)
    }

    /// Reject workflows the engine cannot run.
    ///
    /// Only enabled phases need resolvable agents; a disabled phase may name
    /// agents that are not configured.
    pub fn validate(&self) -> Result<(), EngineError> {
        let mut seen = HashSet::new();
        for phase in &self.phases {
            if !seen.insert(phase.name.as_str()) {
                return Err(EngineError::DuplicatePhase(phase.name.clone()));
            }
        }

        let plan = self.plan();
        if plan.is_empty() {
            return Err(EngineError::EmptyPhaseGraph);
        }

        for phase in plan.phases() {
            if let Some(agent) = phase.agents.iter().find(|a| !self.agents.contains_key(*a)) {
                return Err(EngineError::UnknownAgent {
                    phase: phase.name.clone(),
                    agent: agent.clone(),
                });
            }
        }
        Ok(())
    }
}

/// Workflow written by `waypoint init`.
pub const SAMPLE_WORKFLOW: &str = r#"# Waypoint workflow
#
# Phases run in the order listed. Each phase runs its agents, then checks that
# every `artifacts_required` pattern matches at least one non-empty file.

[engine]
max_parallel_agents = 4
accept_partial = false
skip_optional = false

[[phases]]
name = "ingest"
agents = ["loader"]
artifacts_required = ["data/*.csv"]

[[phases]]
name = "review"
agents = ["reviewer"]
requires_consensus = true

[agents.loader]
strategy = "delegated"
command = "sh"
args = ["-c", "mkdir -p data && echo 'id,value' > data/sample.csv && echo '<artifact>data/sample.csv</artifact>'"]
timeout_secs = 600

[agents.loader.retry]
max_retries = 2
base_backoff_ms = 1000
jitter_fraction = 0.2
retryable_exit_codes = [75]

[agents.reviewer]
strategy = "deferred"
instructions = "Review the files produced by ingest: {{artifacts.ingest}}"
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStrategy;
    use tempfile::tempdir;

    fn two_phase() -> WorkflowConfig {
        let mut agents = BTreeMap::new();
        agents.insert("a".to_string(), AgentConfig::stub());
        WorkflowConfig {
            engine: EngineSettings::default(),
            phases: vec![
                PhaseDefinition::new("one", &["a"]),
                PhaseDefinition::new("two", &["a"]),
            ],
            agents,
        }
    }

    #[test]
    fn test_sample_workflow_parses_and_validates() {
        let config = WorkflowConfig::parse(SAMPLE_WORKFLOW, WorkflowFormat::Toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.plan().names(), vec!["ingest", "review"]);
        assert!(config.phases[1].requires_consensus);
        assert!(matches!(
            config.agents["loader"].strategy,
            AgentStrategy::Delegated(_)
        ));
        assert_eq!(config.engine.state_dir, ".waypoint/runs");
    }

    #[test]
    fn test_defaults_apply_when_engine_table_missing() {
        let config = WorkflowConfig::parse(
            "[[phases]]\nname = \"x\"\n",
            WorkflowFormat::Toml,
        )
        .unwrap();
        assert_eq!(config.engine, EngineSettings::default());
        assert!(config.phases[0].enabled);
        assert!(!config.phases[0].parallel);
    }

    #[test]
    fn test_empty_graph_is_rejected() {
        let config = WorkflowConfig::default();
        assert!(matches!(
            config.validate().unwrap_err(),
            EngineError::EmptyPhaseGraph
        ));

        let mut all_disabled = two_phase();
        for phase in &mut all_disabled.phases {
            phase.enabled = false;
        }
        assert!(matches!(
            all_disabled.validate().unwrap_err(),
            EngineError::EmptyPhaseGraph
        ));
    }

    #[test]
    fn test_unknown_agent_is_rejected() {
        let mut config = two_phase();
        config.phases[1].agents.push("ghost".into());
        match config.validate().unwrap_err() {
            EngineError::UnknownAgent { phase, agent } => {
                assert_eq!(phase, "two");
                assert_eq!(agent, "ghost");
            }
            other => panic!("Expected UnknownAgent, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_agent_in_disabled_phase_is_allowed() {
        let mut config = two_phase();
        config.phases[1].agents.push("ghost".into());
        config.phases[1].enabled = false;
        config.validate().unwrap();
    }

    #[test]
    fn test_duplicate_phase_is_rejected() {
        let mut config = two_phase();
        config.phases[1].name = "one".into();
        assert!(matches!(
            config.validate().unwrap_err(),
            EngineError::DuplicatePhase(name) if name == "one"
        ));
    }

    #[test]
    fn test_skip_optional_drops_optional_phases() {
        let mut config = two_phase();
        config.phases[0].optional = true;
        assert_eq!(config.plan().names(), vec!["one", "two"]);
        config.engine.skip_optional = true;
        assert_eq!(config.plan().names(), vec!["two"]);
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempdir().unwrap();

        let json = dir.path().join("flow.json");
        std::fs::write(
            &json,
            r#"{"phases":[{"name":"j","agents":["s"]}],"agents":{"s":{"strategy":"stub"}}}"#,
        )
        .unwrap();
        let config = WorkflowConfig::load(&json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.plan().names(), vec!["j"]);

        let yaml = dir.path().join("flow.yml");
        std::fs::write(
            &yaml,
            "engine:\n  accept_partial: true\nphases:\n  - name: y\n    agents: [s]\nagents:\n  s:\n    strategy: stub\n    success: false\n",
        )
        .unwrap();
        let config = WorkflowConfig::load(&yaml).unwrap();
        assert!(config.engine.accept_partial);
        assert_eq!(config.plan().names(), vec!["y"]);
    }

    #[test]
    fn test_load_reports_path_on_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[[phases]]\nname = 3\n").unwrap();
        let err = WorkflowConfig::load(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("broken.toml"));
    }
}
