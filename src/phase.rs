//! Phase definitions and ordering for the workflow engine.
//!
//! This module provides:
//! - `PhaseDefinition`, the read-only description of one workflow step
//! - `PhasePlan`, the enabled phases in configured order
//! - Next-phase derivation from a persisted `completed_phases` prefix

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single named step in the workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseDefinition {
    /// Unique phase name (e.g., "ingest", "review")
    pub name: String,
    /// Agent identifiers, executed in this order
    #[serde(default)]
    pub agents: Vec<String>,
    /// Pause for approval after a successful attempt
    #[serde(default)]
    pub requires_consensus: bool,
    /// Optional phases are dropped when the engine runs with `skip_optional`
    #[serde(default)]
    pub optional: bool,
    /// Disabled phases never run
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Dispatch agents to the worker pool instead of one at a time
    #[serde(default)]
    pub parallel: bool,
    /// Glob patterns, relative to the project directory, that must match non-empty files
    #[serde(default)]
    pub artifacts_required: Vec<String>,
    /// Phase-specific supplementary data exposed to agent templates
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, String>,
}

fn default_enabled() -> bool {
    true
}

impl PhaseDefinition {
    /// Create an enabled, sequential, ungated phase.
    pub fn new(name: &str, agents: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            agents: agents.iter().map(|a| a.to_string()).collect(),
            requires_consensus: false,
            optional: false,
            enabled: true,
            parallel: false,
            artifacts_required: Vec::new(),
            context: BTreeMap::new(),
        }
    }

    pub fn with_consensus(mut self) -> Self {
        self.requires_consensus = true;
        self
    }

    pub fn with_artifacts(mut self, patterns: &[&str]) -> Self {
        self.artifacts_required = patterns.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Whether this phase takes part in a run.
    pub fn is_enabled(&self, skip_optional: bool) -> bool {
        self.enabled && !(self.optional && skip_optional)
    }
}

/// The enabled phases of a workflow in execution order.
#[derive(Debug, Clone, Default)]
pub struct PhasePlan {
    phases: Vec<PhaseDefinition>,
}

impl PhasePlan {
    /// Build the plan from the configured phase list.
    pub fn from_definitions(definitions: &[PhaseDefinition], skip_optional: bool) -> Self {
        Self {
            phases: definitions
                .iter()
                .filter(|p| p.is_enabled(skip_optional))
                .cloned()
                .collect(),
        }
    }

    pub fn phases(&self) -> &[PhaseDefinition] {
        &self.phases
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn get(&self, name: &str) -> Option<&PhaseDefinition> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn first(&self) -> Option<&PhaseDefinition> {
        self.phases.first()
    }

    /// First enabled phase that has not completed yet.
    ///
    /// This is the only source of `current_phase` after a success, so resuming
    /// from a persisted prefix always lands on the same phase.
    pub fn next_pending(&self, completed: &[String]) -> Option<&PhaseDefinition> {
        self.phases
            .iter()
            .find(|p| !completed.iter().any(|c| c == &p.name))
    }

    pub fn names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name.clone()).collect()
    }
}
