//! Checkpoint validation of phase artifacts.
//!
//! A checkpoint resolves each required glob pattern under the project root.
//! Only regular files with a non-zero size count as found, so an empty
//! placeholder never satisfies a requirement.
//!
//! | Status    | Rule                                      |
//! |-----------|-------------------------------------------|
//! | `Pass`    | every pattern has a qualifying match      |
//! | `Partial` | some, but not all, patterns have one      |
//! | `Fail`    | no pattern has a qualifying match         |
//!
//! An empty pattern list passes trivially.

use anyhow::{Context, Result};
use chrono::Utc;
use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Overall checkpoint verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pass,
    Partial,
    Fail,
}

impl std::fmt::Display for ValidationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationStatus::Pass => write!(f, "pass"),
            ValidationStatus::Partial => write!(f, "partial"),
            ValidationStatus::Fail => write!(f, "fail"),
        }
    }
}

/// Result of one checkpoint run. Recomputed on every phase attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    /// Patterns that were checked
    pub required: Vec<String>,
    /// Qualifying files, relative to the root, sorted
    pub found: Vec<String>,
    /// Patterns without any qualifying file
    pub missing: Vec<String>,
    /// Where the human-readable report was written, if it was
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
}

impl ValidationResult {
    pub fn passed(&self) -> bool {
        self.status == ValidationStatus::Pass
    }

    /// Patterns that had at least one qualifying file.
    pub fn satisfied(&self) -> Vec<&str> {
        self.required
            .iter()
            .filter(|p| !self.missing.iter().any(|m| m == *p))
            .map(String::as_str)
            .collect()
    }
}

/// Check `patterns` against the file tree under `root`.
pub fn validate(patterns: &[String], root: &Path) -> ValidationResult {
    let mut found: Vec<String> = Vec::new();
    let mut missing = Vec::new();

    for pattern in patterns {
        let matches = qualifying_matches(pattern, root);
        if matches.is_empty() {
            missing.push(pattern.clone());
        }
        for path in matches {
            if !found.contains(&path) {
                found.push(path);
            }
        }
    }
    found.sort();

    let satisfied = patterns.len() - missing.len();
    let status = if missing.is_empty() {
        ValidationStatus::Pass
    } else if satisfied == 0 {
        ValidationStatus::Fail
    } else {
        ValidationStatus::Partial
    };

    tracing::debug!(
        root = %root.display(),
        required = patterns.len(),
        found = found.len(),
        missing = missing.len(),
        %status,
        "checkpoint validated"
    );

    ValidationResult {
        status,
        required: patterns.to_vec(),
        found,
        missing,
        report_path: None,
    }
}

fn qualifying_matches(pattern: &str, root: &Path) -> Vec<String> {
    let full = if Path::new(pattern).is_absolute() {
        pattern.to_string()
    } else {
        format!(
            "{}/{}",
            Pattern::escape(&root.to_string_lossy()),
            pattern.trim_start_matches("./")
        )
    };

    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };

    let entries = match glob::glob_with(&full, options) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(pattern, error = %e, "invalid artifact pattern");
            return Vec::new();
        }
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|path| {
            path.metadata()
                .map(|m| m.is_file() && m.len() > 0)
                .unwrap_or(false)
        })
        .map(|path| display_relative(&path, root))
        .collect()
}

fn display_relative(path: &Path, root: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Human-readable report of a checkpoint.
pub fn render_report(phase: &str, result: &ValidationResult) -> String {
    let mut report = format!(
        "# Checkpoint: {}\n\nStatus: {}\nChecked: {}\n\n",
        phase,
        result.status,
        Utc::now().to_rfc3339()
    );

    if result.required.is_empty() {
        report.push_str("No artifacts required.\n");
        return report;
    }

    report.push_str("## Satisfied\n\n");
    let satisfied = result.satisfied();
    if satisfied.is_empty() {
        report.push_str("- (none)\n");
    }
    for pattern in satisfied {
        report.push_str(&format!("- [x] {}\n", pattern));
    }

    report.push_str("\n## Missing\n\n");
    if result.missing.is_empty() {
        report.push_str("- (none)\n");
    }
    for pattern in &result.missing {
        report.push_str(&format!("- [ ] {}\n", pattern));
    }

    if !result.found.is_empty() {
        report.push_str("\n## Files found\n\n");
        for path in &result.found {
            report.push_str(&format!("- {}\n", path));
        }
    }

    report
}

/// Write the report to `<dir>/<phase>-<timestamp>.md` and record its path.
pub fn write_report(phase: &str, result: &mut ValidationResult, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create report directory: {}", dir.display()))?;
    let path = dir.join(format!(
        "{}-{}.md",
        phase,
        Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
    ));
    std::fs::write(&path, render_report(phase, result))
        .with_context(|| format!("Failed to write checkpoint report: {}", path.display()))?;
    result.report_path = Some(path.clone());
    Ok(path)
}
