//! Initialization of waypoint projects.
//!
//! `waypoint init` creates the `.waypoint/` directory in a project:
//!
//! ```text
//! .waypoint/
//! ├── workflow.toml    # Phases and agents (sample workflow)
//! ├── runs/            # One directory per run
//! └── logs/            # waypoint.log
//! ```
//!
//! Existing files are never overwritten, so running it twice is safe.

use crate::config::WAYPOINT_DIR;
use crate::workflow_config::{SAMPLE_WORKFLOW, WORKFLOW_FILE};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Result of initializing a project.
#[derive(Debug)]
pub struct InitResult {
    /// Path to the `.waypoint` directory
    pub waypoint_dir: PathBuf,
    /// Whether the directory was newly created
    pub created: bool,
    /// Whether the sample workflow was written
    pub wrote_workflow: bool,
}

/// Create or complete the `.waypoint/` structure under `project_dir`.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let waypoint_dir = project_dir.join(WAYPOINT_DIR);
    let created = !waypoint_dir.exists();

    for dir in [
        waypoint_dir.clone(),
        waypoint_dir.join("runs"),
        waypoint_dir.join("logs"),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let workflow_file = waypoint_dir.join(WORKFLOW_FILE);
    let wrote_workflow = !workflow_file.exists();
    if wrote_workflow {
        std::fs::write(&workflow_file, SAMPLE_WORKFLOW).with_context(|| {
            format!("Failed to write workflow file: {}", workflow_file.display())
        })?;
    }

    Ok(InitResult {
        waypoint_dir,
        created,
        wrote_workflow,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_structure() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path()).unwrap();
        assert!(result.created);
        assert!(result.wrote_workflow);
        assert!(result.waypoint_dir.join("runs").is_dir());
        assert!(result.waypoint_dir.join("logs").is_dir());
        let workflow = fs::read_to_string(result.waypoint_dir.join(WORKFLOW_FILE)).unwrap();
        assert_eq!(workflow, SAMPLE_WORKFLOW);
    }

    #[test]
    fn test_init_keeps_existing_workflow() {
        let dir = tempdir().unwrap();
        init_project(dir.path()).unwrap();
        let path = dir.path().join(".waypoint/workflow.toml");
        fs::write(&path, "# mine\n").unwrap();

        let result = init_project(dir.path()).unwrap();
        assert!(!result.created);
        assert!(!result.wrote_workflow);
        assert_eq!(fs::read_to_string(path).unwrap(), "# mine\n");
    }
}
