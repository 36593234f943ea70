//! Deferred interactive agents.
//!
//! The work happens outside the engine (a person, or a long-running external
//! actor). The invoker only renders the instructions with the phase context
//! and writes them where the actor can find them; the phase's artifacts are
//! verified later by the checkpoint validator.

use super::context::PhaseContext;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Static configuration of a deferred agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeferredAgent {
    /// Templated instructions for the external actor
    #[serde(default)]
    pub instructions: String,
}

impl DeferredAgent {
    pub fn new(instructions: &str) -> Self {
        Self {
            instructions: instructions.to_string(),
        }
    }
}

/// Render the instructions document for `context`.
pub fn render_instructions(spec: &DeferredAgent, context: &PhaseContext) -> String {
    let mut doc = format!(
        "# {} / {}\n\nRun: {}\nProject: {}\n",
        context.phase,
        context.agent,
        context.run_id,
        context.project_dir.display()
    );

    if !context.completed_phases.is_empty() {
        doc.push_str(&format!(
            "Completed phases: {}\n",
            context.completed_phases.join(", ")
        ));
    }

    doc.push_str("\n## Instructions\n\n");
    if spec.instructions.trim().is_empty() {
        doc.push_str("(no instructions configured)\n");
    } else {
        doc.push_str(context.interpolate(spec.instructions.trim()).as_str());
        doc.push('\n');
    }

    if !context.prior_artifacts.is_empty() {
        doc.push_str("\n## Artifacts from earlier phases\n\n");
        for (phase, paths) in &context.prior_artifacts {
            for path in paths {
                doc.push_str(&format!("- {}: {}\n", phase, path));
            }
        }
    }

    doc
}

/// Write the rendered instructions to `<dir>/<phase>-<agent>.md`.
pub fn emit_instructions(
    spec: &DeferredAgent,
    context: &PhaseContext,
    dir: &Path,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create instructions directory: {}", dir.display()))?;
    let path = dir.join(format!("{}-{}.md", context.phase, context.agent));
    std::fs::write(&path, render_instructions(spec, context))
        .with_context(|| format!("Failed to write instructions: {}", path.display()))?;
    Ok(path)
}
