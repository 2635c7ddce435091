//! Production agent backed by a headless CLI process.
//!
//! Spawns the configured command (a `claude`-style CLI by default), writes
//! the composed prompt to stdin, and extracts the structured JSON object from
//! stdout. Transport-level failures (spawn, non-zero exit, timeout) and
//! malformed payloads map onto the `AgentError` taxonomy so the retry policy
//! can tell them apart.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use super::{Agent, AgentResponse, PromptSpec};
use crate::errors::AgentError;
use crate::util::extract_json_object;

/// Agent that shells out to a headless LLM CLI.
pub struct CliAgent {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CliAgent {
    /// Create an agent running `command` in `working_dir`.
    ///
    /// The command is resolved from the `ANVIL_AGENT_CMD` environment
    /// variable when `command` is `None`.
    pub fn new(command: Option<String>, working_dir: &Path, timeout: Duration) -> Self {
        let command = command
            .or_else(|| std::env::var("ANVIL_AGENT_CMD").ok())
            .unwrap_or_else(|| "claude".to_string());
        Self {
            command,
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "json".to_string(),
            ],
            working_dir: working_dir.to_path_buf(),
            timeout,
        }
    }

    /// Override the arguments passed to the CLI.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    fn compose(spec: &PromptSpec) -> String {
        let mut prompt = String::new();
        if !spec.system.is_empty() {
            prompt.push_str("## SYSTEM\n");
            prompt.push_str(&spec.system);
            prompt.push_str("\n\n");
        }
        prompt.push_str(&spec.user);
        if !spec.response_schema.is_null() {
            prompt.push_str("\n\n## RESPONSE FORMAT\nRespond with a single JSON object matching:\n");
            prompt.push_str(&spec.response_schema.to_string());
        }
        prompt
    }
}

#[async_trait]
impl Agent for CliAgent {
    async fn prompt(&self, spec: &PromptSpec) -> Result<AgentResponse, AgentError> {
        let prompt = Self::compose(spec);
        debug!(
            command = %self.command,
            prompt_chars = prompt.len(),
            model = %spec.config.model,
            "spawning agent process"
        );

        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .arg("--model")
            .arg(&spec.config.model)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::Transport(format!("failed to spawn {}: {e}", self.command)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| AgentError::Transport(format!("failed to write prompt: {e}")))?;
            stdin
                .shutdown()
                .await
                .map_err(|e| AgentError::Transport(format!("failed to close stdin: {e}")))?;
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => {
                result.map_err(|e| AgentError::Transport(format!("failed to wait: {e}")))?
            }
            Err(_) => return Err(AgentError::Timeout(self.timeout.as_secs())),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::Transport(format!(
                "agent exited with {}: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let json_text = extract_json_object(&stdout)
            .ok_or_else(|| AgentError::SchemaMismatch("no JSON object in agent output".into()))?;
        let value: serde_json::Value = serde_json::from_str(&json_text)
            .map_err(|e| AgentError::SchemaMismatch(e.to_string()))?;
        Ok(AgentResponse(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn sh_agent(dir: &Path, script: &str, timeout_secs: u64) -> CliAgent {
        CliAgent::new(
            Some("sh".to_string()),
            dir,
            Duration::from_secs(timeout_secs),
        )
        .with_args(vec!["-c".to_string(), script.to_string(), "sh".to_string()])
    }

    #[tokio::test]
    async fn test_extracts_json_from_stdout() {
        let dir = tempdir().unwrap();
        // The script ignores the trailing --model args and prints a payload.
        let agent = sh_agent(
            dir.path(),
            r#"cat > /dev/null; echo 'preamble {"result": "success", "message": "ok"} trailer'"#,
            5,
        );
        let response = agent.prompt(&PromptSpec::new("", "hello")).await.unwrap();
        assert_eq!(response.json()["result"], "success");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_transport_error() {
        let dir = tempdir().unwrap();
        let agent = sh_agent(dir.path(), "cat > /dev/null; echo boom >&2; exit 3", 5);
        let err = agent.prompt(&PromptSpec::new("", "hello")).await.unwrap_err();
        match err {
            AgentError::Transport(msg) => assert!(msg.contains("boom")),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_maps_to_timeout_error() {
        let dir = tempdir().unwrap();
        let agent = sh_agent(dir.path(), "cat > /dev/null; sleep 10", 1);
        let err = agent.prompt(&PromptSpec::new("", "hello")).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout(1)));
    }

    #[tokio::test]
    async fn test_missing_json_is_schema_mismatch() {
        let dir = tempdir().unwrap();
        let agent = sh_agent(dir.path(), "cat > /dev/null; echo 'plain text only'", 5);
        let err = agent.prompt(&PromptSpec::new("", "hello")).await.unwrap_err();
        assert!(matches!(err, AgentError::SchemaMismatch(_)));
    }

    #[test]
    fn test_compose_includes_schema() {
        let spec = PromptSpec::new("system text", "user text")
            .with_schema(json!({"type": "object"}));
        let prompt = CliAgent::compose(&spec);
        assert!(prompt.contains("## SYSTEM"));
        assert!(prompt.contains("system text"));
        assert!(prompt.contains("user text"));
        assert!(prompt.contains("## RESPONSE FORMAT"));
    }
}
