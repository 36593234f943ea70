use anyhow::{Context, Result, anyhow};
use glob::glob;
use std::path::{Path, PathBuf};

use crate::engine::state::StateStore;
use crate::workflow_config::{WORKFLOW_FILE, WorkflowConfig};

/// Project-local directory holding the workflow file and run state.
pub const WAYPOINT_DIR: &str = ".waypoint";
const CURRENT_RUN_FILE: &str = "current";

/// Runtime configuration for Waypoint.
///
/// Bridges the loaded `WorkflowConfig` with the paths the engine and the CLI
/// need. Every path is derived from the project directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub waypoint_dir: PathBuf,
    pub workflow_file: PathBuf,
    pub runs_dir: PathBuf,
    pub log_dir: PathBuf,
    pub workflow: WorkflowConfig,
}

impl Config {
    /// Load the workflow for `project_dir`.
    ///
    /// Without an explicit `workflow_file`, `.waypoint/workflow.toml` is used,
    /// falling back to any `.waypoint/workflow.*` (JSON or YAML).
    pub fn load(project_dir: PathBuf, workflow_file: Option<PathBuf>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let workflow_file = match workflow_file {
            Some(path) => path
                .canonicalize()
                .with_context(|| format!("Failed to resolve workflow file: {}", path.display()))?,
            None => Self::find_workflow_file(&project_dir)?,
        };

        let workflow = WorkflowConfig::load(&workflow_file)?;
        let mut config = Self::from_workflow(project_dir, workflow);
        config.workflow_file = workflow_file;
        Ok(config)
    }

    /// Build a config around an in-memory workflow.
    pub fn from_workflow(project_dir: PathBuf, workflow: WorkflowConfig) -> Self {
        let waypoint_dir = project_dir.join(WAYPOINT_DIR);
        let workflow_file = waypoint_dir.join(WORKFLOW_FILE);
        let runs_dir = project_dir.join(&workflow.engine.state_dir);
        let log_dir = waypoint_dir.join("logs");
        Self {
            project_dir,
            waypoint_dir,
            workflow_file,
            runs_dir,
            log_dir,
            workflow,
        }
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(&self.runs_dir)
    }

    pub fn current_run_file(&self) -> PathBuf {
        self.waypoint_dir.join(CURRENT_RUN_FILE)
    }

    /// Run id recorded by the most recent `start`.
    pub fn current_run(&self) -> Result<Option<String>> {
        let path = self.current_run_file();
        if !path.exists() {
            return Ok(None);
        }
        let id = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let id = id.trim();
        Ok((!id.is_empty()).then(|| id.to_string()))
    }

    pub fn set_current_run(&self, run_id: &str) -> Result<()> {
        std::fs::create_dir_all(&self.waypoint_dir)
            .context("Failed to create .waypoint directory")?;
        std::fs::write(self.current_run_file(), format!("{}\n", run_id))
            .context("Failed to record current run")?;
        Ok(())
    }

    /// The explicit run id, or the current one.
    pub fn resolve_run(&self, explicit: Option<&str>) -> Result<String> {
        match explicit {
            Some(id) => Ok(id.to_string()),
            None => self.current_run()?.ok_or_else(|| {
                anyhow!("No current run. Start one with `waypoint start` or pass --run")
            }),
        }
    }

    fn find_workflow_file(project_dir: &Path) -> Result<PathBuf> {
        let default = project_dir.join(WAYPOINT_DIR).join(WORKFLOW_FILE);
        if default.exists() {
            return Ok(default);
        }

        let pattern = project_dir
            .join(WAYPOINT_DIR)
            .join("workflow.*")
            .to_string_lossy()
            .to_string();

        let mut candidates: Vec<PathBuf> = glob(&pattern)
            .context("Failed to read glob pattern")?
            .filter_map(|entry| entry.ok())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("json" | "yaml" | "yml")
                )
            })
            .collect();

        if candidates.is_empty() {
            return Err(anyhow!(
                "No workflow file found. Run `waypoint init` or pass --workflow"
            ));
        }

        candidates.sort();
        Ok(candidates.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow_config::SAMPLE_WORKFLOW;
    use std::fs;
    use tempfile::tempdir;

    fn write_workflow(dir: &Path, name: &str, content: &str) -> PathBuf {
        let waypoint_dir = dir.join(WAYPOINT_DIR);
        fs::create_dir_all(&waypoint_dir).unwrap();
        let path = waypoint_dir.join(name);
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_default_workflow_and_paths() {
        let dir = tempdir().unwrap();
        write_workflow(dir.path(), WORKFLOW_FILE, SAMPLE_WORKFLOW);
        let config = Config::load(dir.path().to_path_buf(), None).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.project_dir, root);
        assert_eq!(config.workflow_file, root.join(".waypoint/workflow.toml"));
        assert_eq!(config.runs_dir, root.join(".waypoint/runs"));
        assert_eq!(config.log_dir, root.join(".waypoint/logs"));
        assert_eq!(config.workflow.plan().len(), 2);
    }

    #[test]
    fn test_load_falls_back_to_other_formats() {
        let dir = tempdir().unwrap();
        write_workflow(
            dir.path(),
            "workflow.yaml",
            "phases:\n  - name: only\n    agents: [s]\nagents:\n  s:\n    strategy: stub\n",
        );
        let config = Config::load(dir.path().to_path_buf(), None).unwrap();
        assert!(config.workflow_file.ends_with("workflow.yaml"));
        assert_eq!(config.workflow.plan().names(), vec!["only"]);
    }

    #[test]
    fn test_load_explicit_workflow() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, SAMPLE_WORKFLOW).unwrap();
        let config = Config::load(dir.path().to_path_buf(), Some(path.clone())).unwrap();
        assert_eq!(config.workflow_file, path.canonicalize().unwrap());
    }

    #[test]
    fn test_load_without_workflow_errors() {
        let dir = tempdir().unwrap();
        let err = Config::load(dir.path().to_path_buf(), None).unwrap_err();
        assert!(err.to_string().contains("No workflow file found"));
    }

    #[test]
    fn test_custom_state_dir() {
        let dir = tempdir().unwrap();
        let mut workflow = WorkflowConfig::default();
        workflow.engine.state_dir = "state".into();
        let config = Config::from_workflow(dir.path().to_path_buf(), workflow);
        assert_eq!(config.runs_dir, dir.path().join("state"));
        assert_eq!(config.state_store().root(), dir.path().join("state"));
    }

    #[test]
    fn test_current_run_pointer() {
        let dir = tempdir().unwrap();
        let config = Config::from_workflow(dir.path().to_path_buf(), WorkflowConfig::default());
        assert_eq!(config.current_run().unwrap(), None);
        assert!(config.resolve_run(None).is_err());
        assert_eq!(config.resolve_run(Some("explicit")).unwrap(), "explicit");

        config.set_current_run("run-42").unwrap();
        assert_eq!(config.current_run().unwrap().as_deref(), Some("run-42"));
        assert_eq!(config.resolve_run(None).unwrap(), "run-42");
    }
}
