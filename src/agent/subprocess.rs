//! Delegated subprocess execution.
//!
//! One call runs one attempt:
//! - Spawns the interpolated command in the project directory
//! - Passes the `PhaseContext` as JSON via stdin plus `WAYPOINT_*` environment variables
//! - Waits for exit under a timeout; the child is killed if the timeout fires
//! - Collects `<artifact>path</artifact>` tags from stdout
//!
//! Retrying is the caller's concern (see `retry`).

use super::context::PhaseContext;
use crate::errors::InvokeError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::retry::RetryPolicy;

static ARTIFACT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<artifact>\s*(.*?)\s*</artifact>").unwrap());

/// Static configuration of a delegated agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DelegatedAgent {
    /// Program to run (templated)
    pub command: String,
    /// Arguments (each templated)
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-attempt timeout
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra environment variables (values templated)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_timeout_secs() -> u64 {
    600
}

impl DelegatedAgent {
    pub fn new(command: &str, args: &[&str]) -> Self {
        Self {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout_secs: default_timeout_secs(),
            env: BTreeMap::new(),
            retry: RetryPolicy::default(),
        }
    }

    /// Convenience for `sh -c <script>` agents.
    pub fn shell(script: &str) -> Self {
        Self::new("sh", &["-c", script])
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

/// What a successful attempt produced.
#[derive(Debug, Clone, Default)]
pub struct SubprocessOutput {
    pub stdout: String,
    pub stderr: String,
    /// Paths declared with `<artifact>` tags, in output order
    pub artifacts: Vec<String>,
    pub log_file: Option<PathBuf>,
}

/// Extract `<artifact>` tags from agent output.
pub fn parse_artifact_tags(text: &str) -> Vec<String> {
    let mut artifacts: Vec<String> = Vec::new();
    for cap in ARTIFACT_REGEX.captures_iter(text) {
        if let Some(m) = cap.get(1) {
            let path = m.as_str().trim();
            if !path.is_empty() && !artifacts.iter().any(|a| a == path) {
                artifacts.push(path.to_string());
            }
        }
    }
    artifacts
}

/// Run a single attempt of a delegated agent.
///
/// `log_dir`, when given, receives `<phase>-<agent>-attempt-<n>.log` with the
/// command line, exit code, stdout and stderr.
pub async fn run_attempt(
    spec: &DelegatedAgent,
    context: &PhaseContext,
    attempt: u32,
    log_dir: Option<&Path>,
) -> Result<SubprocessOutput, InvokeError> {
    let command = context.interpolate(spec.command.trim());
    if command.is_empty() {
        return Err(InvokeError::MissingCommand(context.agent.clone()));
    }
    let args: Vec<String> = spec.args.iter().map(|a| context.interpolate(a)).collect();

    let context_json = serde_json::to_string(context)
        .map_err(|e| InvokeError::Other(anyhow::Error::new(e).context("Failed to serialize agent context")))?;

    tracing::debug!(
        agent = %context.agent,
        phase = %context.phase,
        attempt,
        command = %command,
        timeout_secs = spec.timeout_secs,
        "spawning delegated agent"
    );

    let mut cmd = Command::new(&command);
    cmd.args(&args)
        .current_dir(&context.project_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .env("WAYPOINT_RUN_ID", &context.run_id)
        .env("WAYPOINT_PHASE", &context.phase)
        .env("WAYPOINT_AGENT", &context.agent)
        .env("WAYPOINT_ATTEMPT", attempt.to_string())
        .env("WAYPOINT_PROJECT_DIR", &context.project_dir);
    for (key, value) in &spec.env {
        cmd.env(key, context.interpolate(value));
    }

    let mut child = cmd.spawn().map_err(|source| InvokeError::SpawnFailed {
        command: command.clone(),
        source,
    })?;

    // Feed stdin from a separate task so a child that never reads it cannot stall us.
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            let _ = stdin.write_all(context_json.as_bytes()).await;
            let _ = stdin.shutdown().await;
        });
    }

    let output = match timeout(
        Duration::from_secs(spec.timeout_secs),
        child.wait_with_output(),
    )
    .await
    {
        Ok(result) => result.map_err(|e| {
            InvokeError::Other(anyhow::Error::new(e).context("Failed to wait for agent command"))
        })?,
        Err(_) => {
            return Err(InvokeError::TimedOut {
                secs: spec.timeout_secs,
            });
        }
    };

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let log_file = match log_dir {
        Some(dir) => write_attempt_log(dir, context, attempt, &command, &args, exit_code, &stdout, &stderr),
        None => None,
    };

    tracing::debug!(
        agent = %context.agent,
        attempt,
        exit_code,
        "delegated agent exited"
    );

    if !output.status.success() {
        let detail = if stderr.trim().is_empty() {
            tail(stdout.trim(), 400)
        } else {
            tail(stderr.trim(), 400)
        };
        return Err(InvokeError::NonZeroExit {
            code: exit_code,
            stderr: detail,
        });
    }

    Ok(SubprocessOutput {
        artifacts: parse_artifact_tags(&stdout),
        stdout,
        stderr,
        log_file,
    })
}

#[allow(clippy::too_many_arguments)]
fn write_attempt_log(
    dir: &Path,
    context: &PhaseContext,
    attempt: u32,
    command: &str,
    args: &[String],
    exit_code: i32,
    stdout: &str,
    stderr: &str,
) -> Option<PathBuf> {
    let path = dir.join(format!(
        "{}-{}-attempt-{}.log",
        context.phase, context.agent, attempt
    ));
    let body = format!(
        "$ {} {}\nexit: {}\n\n--- stdout ---\n{}\n--- stderr ---\n{}\n",
        command,
        args.join(" "),
        exit_code,
        stdout,
        stderr
    );
    let written = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, body));
    match written {
        Ok(()) => Some(path),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to write agent log");
            None
        }
    }
}

/// Last `max_chars` characters of `text`.
pub(crate) fn tail(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        text.to_string()
    } else {
        text.chars().skip(count - max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn context(dir: &Path) -> PhaseContext {
        let mut supplementary = BTreeMap::new();
        supplementary.insert("greeting".to_string(), "hello".to_string());
        PhaseContext::build(
            "run-7",
            "ingest",
            "loader",
            dir.to_path_buf(),
            &json!({"name": "atlas"}),
            &[],
            &BTreeMap::new(),
            &supplementary,
        )
    }

    #[test]
    fn test_parse_artifact_tags_dedupes_and_trims() {
        let text = "working\n<artifact> data/a.csv </artifact>\n<artifact>data/a.csv</artifact><artifact>b.txt</artifact>\n<artifact></artifact>";
        assert_eq!(parse_artifact_tags(text), vec!["data/a.csv", "b.txt"]);
    }

    #[test]
    fn test_tail_keeps_last_chars() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ab", 3), "ab");
    }

    #[tokio::test]
    async fn test_run_attempt_success_collects_artifacts_and_env() {
        let dir = tempdir().unwrap();
        let spec = DelegatedAgent::shell(
            "mkdir -p out && echo \"$WAYPOINT_PHASE $WAYPOINT_ATTEMPT\" > out/x.txt && echo '<artifact>out/x.txt</artifact>'",
        );
        let out = run_attempt(&spec, &context(dir.path()), 2, Some(&dir.path().join("logs")))
            .await
            .unwrap();
        assert_eq!(out.artifacts, vec!["out/x.txt"]);
        let written = std::fs::read_to_string(dir.path().join("out/x.txt")).unwrap();
        assert_eq!(written.trim(), "ingest 2");
        let log = out.log_file.unwrap();
        assert!(log.ends_with("ingest-loader-attempt-2.log"));
        assert!(std::fs::read_to_string(log).unwrap().contains("exit: 0"));
    }

    #[tokio::test]
    async fn test_run_attempt_interpolates_args_and_reads_stdin_context() {
        let dir = tempdir().unwrap();
        let spec = DelegatedAgent::shell("cat > ctx.json; echo {{greeting}} {{intake.name}} > msg.txt");
        run_attempt(&spec, &context(dir.path()), 1, None).await.unwrap();
        let msg = std::fs::read_to_string(dir.path().join("msg.txt")).unwrap();
        assert_eq!(msg.trim(), "hello atlas");
        let ctx: PhaseContext =
            serde_json::from_str(&std::fs::read_to_string(dir.path().join("ctx.json")).unwrap())
                .unwrap();
        assert_eq!(ctx.run_id, "run-7");
    }

    #[tokio::test]
    async fn test_run_attempt_non_zero_exit_reports_stderr() {
        let dir = tempdir().unwrap();
        let spec = DelegatedAgent::shell("echo 'upstream busy' >&2; exit 75");
        let err = run_attempt(&spec, &context(dir.path()), 1, None)
            .await
            .unwrap_err();
        match err {
            InvokeError::NonZeroExit { code, stderr } => {
                assert_eq!(code, 75);
                assert_eq!(stderr, "upstream busy");
            }
            other => panic!("Expected NonZeroExit, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_attempt_times_out() {
        let dir = tempdir().unwrap();
        let spec = DelegatedAgent::shell("sleep 5").with_timeout_secs(1);
        let err = run_attempt(&spec, &context(dir.path()), 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::TimedOut { secs: 1 }));
    }

    #[tokio::test]
    async fn test_run_attempt_missing_program_is_spawn_failure() {
        let dir = tempdir().unwrap();
        let spec = DelegatedAgent::new("definitely-not-a-real-program-xyz", &[]);
        let err = run_attempt(&spec, &context(dir.path()), 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::SpawnFailed { .. }));
    }
}
