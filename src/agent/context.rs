//! Context assembly and template interpolation shared by every agent strategy.
//!
//! A `PhaseContext` gathers the project intake, the artifacts of phases that
//! already completed, and the phase's supplementary data. Templates reference
//! it with `{{key}}` placeholders:
//!
//! | Placeholder            | Value                                            |
//! |------------------------|--------------------------------------------------|
//! | `{{run_id}}`           | run identifier                                   |
//! | `{{phase}}`            | current phase name                               |
//! | `{{agent}}`            | current agent name                               |
//! | `{{project_dir}}`      | project root                                     |
//! | `{{completed_phases}}` | comma-separated completed phase names            |
//! | `{{artifacts.<phase>}}`| space-separated artifacts of a completed phase   |
//! | `{{intake.<path>}}`    | dotted lookup into the intake JSON               |
//! | `{{<key>}}`            | phase supplementary data                         |
//!
//! Unknown placeholders are left untouched.

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").unwrap());

/// Everything an agent is told about the run it is working in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseContext {
    pub run_id: String,
    pub phase: String,
    pub agent: String,
    pub project_dir: PathBuf,
    /// Opaque project metadata from `start()`
    pub intake: Value,
    pub completed_phases: Vec<String>,
    /// Artifacts of every completed phase, keyed by phase name
    pub prior_artifacts: BTreeMap<String, Vec<String>>,
    /// Phase-specific supplementary data
    pub supplementary: BTreeMap<String, String>,
}

impl PhaseContext {
    /// Assemble a context. Pure: nothing is read from disk.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        run_id: &str,
        phase: &str,
        agent: &str,
        project_dir: PathBuf,
        intake: &Value,
        completed_phases: &[String],
        phase_artifacts: &BTreeMap<String, Vec<String>>,
        supplementary: &BTreeMap<String, String>,
    ) -> Self {
        let prior_artifacts = phase_artifacts
            .iter()
            .filter(|(name, _)| completed_phases.contains(name))
            .map(|(name, paths)| (name.clone(), paths.clone()))
            .collect();

        Self {
            run_id: run_id.to_string(),
            phase: phase.to_string(),
            agent: agent.to_string(),
            project_dir,
            intake: intake.clone(),
            completed_phases: completed_phases.to_vec(),
            prior_artifacts,
            supplementary: supplementary.clone(),
        }
    }

    /// Same context, addressed to a different agent of the phase.
    pub fn for_agent(&self, agent: &str) -> Self {
        Self {
            agent: agent.to_string(),
            ..self.clone()
        }
    }

    /// Resolve a single placeholder key.
    pub fn lookup(&self, key: &str) -> Option<String> {
        match key {
            "run_id" => return Some(self.run_id.clone()),
            "phase" => return Some(self.phase.clone()),
            "agent" => return Some(self.agent.clone()),
            "project_dir" => return Some(self.project_dir.display().to_string()),
            "completed_phases" => return Some(self.completed_phases.join(",")),
            _ => {}
        }

        if let Some(phase) = key.strip_prefix("artifacts.") {
            return self.prior_artifacts.get(phase).map(|paths| paths.join(" "));
        }

        if let Some(path) = key.strip_prefix("intake.") {
            return lookup_json(&self.intake, path).map(json_to_text);
        }

        self.supplementary.get(key).cloned()
    }

    /// Substitute every known `{{key}}` placeholder in `template`.
    pub fn interpolate(&self, template: &str) -> String {
        PLACEHOLDER
            .replace_all(template, |caps: &Captures| {
                self.lookup(&caps[1])
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }
}

fn lookup_json<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn json_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> PhaseContext {
        let mut artifacts = BTreeMap::new();
        artifacts.insert("ingest".to_string(), vec!["data/a.csv".into(), "data/b.csv".into()]);
        artifacts.insert("stale".to_string(), vec!["old.txt".into()]);
        let mut supplementary = BTreeMap::new();
        supplementary.insert("audience".to_string(), "operators".to_string());

        PhaseContext::build(
            "run-1",
            "review",
            "reviewer",
            PathBuf::from("/work"),
            &json!({"project": {"name": "atlas", "tags": ["etl", "batch"]}, "size": 3}),
            &["ingest".to_string()],
            &artifacts,
            &supplementary,
        )
    }

    #[test]
    fn test_build_only_keeps_completed_phase_artifacts() {
        let ctx = sample();
        assert_eq!(ctx.prior_artifacts.len(), 1);
        assert!(ctx.prior_artifacts.contains_key("ingest"));
    }

    #[test]
    fn test_interpolate_builtin_and_intake_keys() {
        let ctx = sample();
        let out = ctx.interpolate(
            "{{phase}}/{{agent}} for {{ intake.project.name }} ({{intake.project.tags.1}}, {{intake.size}})",
        );
        assert_eq!(out, "review/reviewer for atlas (batch, 3)");
    }

    #[test]
    fn test_interpolate_artifacts_and_supplementary() {
        let ctx = sample();
        assert_eq!(
            ctx.interpolate("check {{artifacts.ingest}} for {{audience}}"),
            "check data/a.csv data/b.csv for operators"
        );
    }

    #[test]
    fn test_unknown_placeholders_left_untouched() {
        let ctx = sample();
        assert_eq!(
            ctx.interpolate("{{nope}} {{intake.project.missing}} {{artifacts.stale}}"),
            "{{nope}} {{intake.project.missing}} {{artifacts.stale}}"
        );
    }

    #[test]
    fn test_for_agent_only_changes_agent() {
        let ctx = sample();
        let other = ctx.for_agent("second");
        assert_eq!(other.agent, "second");
        assert_eq!(other.phase, ctx.phase);
        assert_eq!(other.prior_artifacts, ctx.prior_artifacts);
    }
}
