//! Consensus gate.
//!
//! The gate is stateless: `request` summarises a successful phase attempt for
//! a reviewer, `decide` turns the reviewer's answer into a decision record.
//! The engine is the only caller and the only interpreter of either value.
//!
//! Both records are kept as append-only JSON documents under the run's
//! `consensus/` directory by `ConsensusStore`.

use crate::checkpoint::ValidationStatus;
use crate::engine::PhaseOutcome;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Per-agent line of a consensus request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub agent: String,
    pub success: bool,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Approval artifact generated when a gated phase succeeds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRequest {
    pub run_id: String,
    pub phase_name: String,
    pub created_at: DateTime<Utc>,
    /// One-paragraph human-readable summary
    pub summary: String,
    pub agents: Vec<AgentSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_status: Option<ValidationStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
    /// Artifacts the phase will record once approved
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// A reviewer's answer to a `ConsensusRequest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub run_id: String,
    pub phase_name: String,
    pub decided_at: DateTime<Utc>,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConsensusDecision {
    pub fn verdict(&self) -> &'static str {
        if self.approved { "approved" } else { "rejected" }
    }
}

/// Stateless approval gate.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsensusGate;

impl ConsensusGate {
    /// Summarise `outcome` into an approval request.
    pub fn request(&self, run_id: &str, outcome: &PhaseOutcome, artifacts: &[String]) -> ConsensusRequest {
        let agents: Vec<AgentSummary> = outcome
            .agent_outcomes
            .iter()
            .map(|o| AgentSummary {
                agent: o.agent_name.clone(),
                success: o.success,
                artifacts: o.artifacts.clone(),
                notes: o.notes.clone(),
                error: o.error.clone(),
            })
            .collect();

        let succeeded = agents.iter().filter(|a| a.success).count();
        let external = outcome
            .agent_outcomes
            .iter()
            .filter(|o| o.awaiting_external)
            .count();

        let mut summary = format!(
            "Phase '{}' finished: {}/{} agents succeeded",
            outcome.phase_name,
            succeeded,
            agents.len()
        );
        if external > 0 {
            summary.push_str(&format!(", {} handed to an external actor", external));
        }
        match &outcome.validation {
            Some(v) => summary.push_str(&format!(
                "; checkpoint {} ({} of {} patterns satisfied)",
                v.status,
                v.required.len() - v.missing.len(),
                v.required.len()
            )),
            None => summary.push_str("; no checkpoint required"),
        }
        summary.push('.');

        ConsensusRequest {
            run_id: run_id.to_string(),
            phase_name: outcome.phase_name.clone(),
            created_at: Utc::now(),
            summary,
            agents,
            validation_status: outcome.validation.as_ref().map(|v| v.status),
            report_path: outcome
                .validation
                .as_ref()
                .and_then(|v| v.report_path.clone()),
            artifacts: artifacts.to_vec(),
        }
    }

    /// Record a reviewer's decision for `phase`.
    pub fn decide(
        &self,
        run_id: &str,
        phase: &str,
        approved: bool,
        reason: Option<&str>,
    ) -> ConsensusDecision {
        ConsensusDecision {
            run_id: run_id.to_string(),
            phase_name: phase.to_string(),
            decided_at: Utc::now(),
            approved,
            reason: reason
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string),
        }
    }
}

/// Append-only store of consensus documents for one run.
#[derive(Debug, Clone)]
pub struct ConsensusStore {
    dir: PathBuf,
}

impl ConsensusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn record_request(&self, request: &ConsensusRequest) -> Result<PathBuf> {
        let stem = format!(
            "{}-request-{}",
            request.phase_name,
            timestamp(&request.created_at)
        );
        self.append(&stem, request)
    }

    pub fn record_decision(&self, decision: &ConsensusDecision) -> Result<PathBuf> {
        let stem = format!(
            "{}-decision-{}",
            decision.phase_name,
            timestamp(&decision.decided_at)
        );
        self.append(&stem, decision)
    }

    /// All requests, oldest first.
    pub fn requests(&self) -> Result<Vec<ConsensusRequest>> {
        let mut requests: Vec<ConsensusRequest> = self.read_all("-request-")?;
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(requests)
    }

    /// All decisions, oldest first.
    pub fn decisions(&self) -> Result<Vec<ConsensusDecision>> {
        let mut decisions: Vec<ConsensusDecision> = self.read_all("-decision-")?;
        decisions.sort_by(|a, b| a.decided_at.cmp(&b.decided_at));
        Ok(decisions)
    }

    /// Most recent request for `phase`, if any.
    pub fn latest_request(&self, phase: &str) -> Result<Option<ConsensusRequest>> {
        Ok(self
            .requests()?
            .into_iter()
            .rev()
            .find(|r| r.phase_name == phase))
    }

    fn append<T: Serialize>(&self, stem: &str, record: &T) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir).with_context(|| {
            format!("Failed to create consensus directory: {}", self.dir.display())
        })?;
        let content =
            serde_json::to_string_pretty(record).context("Failed to serialize consensus record")?;

        // Never overwrite an earlier record, even within the same millisecond.
        let mut suffix = 0u32;
        loop {
            let name = if suffix == 0 {
                format!("{}.json", stem)
            } else {
                format!("{}-{}.json", stem, suffix)
            };
            let path = self.dir.join(name);
            match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(content.as_bytes()).with_context(|| {
                        format!("Failed to write consensus record: {}", path.display())
                    })?;
                    tracing::debug!(path = %path.display(), "consensus record written");
                    return Ok(path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("Failed to create consensus record: {}", path.display())
                    });
                }
            }
        }
    }

    fn read_all<T: serde::de::DeserializeOwned>(&self, marker: &str) -> Result<Vec<T>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read consensus directory: {}", self.dir.display()))?
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.contains(marker) || path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read consensus record: {}", path.display()))?;
            let record = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse consensus record: {}", path.display()))?;
            records.push(record);
        }
        Ok(records)
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.3fZ").to_string()
}
