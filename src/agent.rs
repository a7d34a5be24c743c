//! Worker spawner: invokes the external agent subprocess and parses its
//! JSON reply envelope.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::Deserialize;

/// How an agent invocation failed.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent spawn failed: {0}")]
    SpawnFailed(String),

    #[error("agent timed out after {timeout_secs}s")]
    TimedOut { timeout_secs: u64 },

    #[error("agent exited with code {code}: {stderr}")]
    ExitedNonZero { code: i32, stderr: String },

    #[error("agent output unparseable: {0}")]
    OutputUnparseable(String),

    #[error("agent reply has wrong type {got:?} (expected \"result\")")]
    WrongType { got: String },
}

/// Parsed agent reply envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentReply {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(flatten)]
    reply: AgentReply,
}

/// One agent invocation: a task prompt plus execution context.
pub struct AgentInvocation {
    program: String,
    prompt: String,
    system_prompt: String,
    allowed_tools: Vec<String>,
    mcp_config: Option<PathBuf>,
    workdir: Option<PathBuf>,
    timeout: Duration,
}

impl AgentInvocation {
    pub fn new(prompt: &str, timeout: Duration) -> Self {
        Self {
            program: "claude".to_string(),
            prompt: prompt.to_string(),
            system_prompt: String::new(),
            allowed_tools: Vec::new(),
            mcp_config: None,
            workdir: None,
            timeout,
        }
    }

    /// Override the agent program. Used by tests to substitute a stub.
    pub fn program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn system_prompt(mut self, system_prompt: &str) -> Self {
        self.system_prompt = system_prompt.to_string();
        self
    }

    pub fn allowed_tools(mut self, tools: &[String]) -> Self {
        self.allowed_tools = tools.to_vec();
        self
    }

    pub fn mcp_config(mut self, path: &Path) -> Self {
        self.mcp_config = Some(path.to_path_buf());
        self
    }

    pub fn workdir(mut self, dir: &Path) -> Self {
        self.workdir = Some(dir.to_path_buf());
        self
    }

    fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.prompt.clone(),
            "--output-format".to_string(),
            "json".to_string(),
            "--dangerously-skip-permissions".to_string(),
        ];
        if !self.system_prompt.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(self.system_prompt.clone());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        if let Some(ref mcp) = self.mcp_config {
            args.push("--mcp-config".to_string());
            args.push(mcp.display().to_string());
        }
        args
    }

    /// Spawn the agent, enforce the hard timeout, and parse the JSON reply.
    #[tracing::instrument(skip(self), fields(timeout_secs = self.timeout.as_secs()))]
    pub fn spawn(&self) -> Result<AgentReply, AgentError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.build_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(ref dir) = self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AgentError::SpawnFailed(e.to_string()))?;

        // Drain pipes on reader threads so a chatty agent can't fill the
        // pipe buffer and deadlock against our wait loop.
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::SpawnFailed("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AgentError::SpawnFailed("stderr not captured".to_string()))?;

        let stdout_handle = std::thread::spawn(move || read_to_string_lossy(stdout));
        let stderr_handle = std::thread::spawn(move || read_to_string_lossy(stderr));

        let start = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if start.elapsed() >= self.timeout {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(AgentError::TimedOut {
                            timeout_secs: self.timeout.as_secs(),
                        });
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => return Err(AgentError::SpawnFailed(e.to_string())),
            }
        };

        let stdout_text = stdout_handle.join().unwrap_or_default();
        let stderr_text = stderr_handle.join().unwrap_or_default();

        if !status.success() {
            return Err(AgentError::ExitedNonZero {
                code: status.code().unwrap_or(-1),
                stderr: stderr_text.trim().to_string(),
            });
        }

        parse_reply(&stdout_text)
    }

    /// Open an interactive agent session with the prompt as opening context,
    /// inheriting the operator's terminal. Blocks until the session exits.
    pub fn spawn_interactive(&self) -> Result<(), AgentError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.prompt);
        if !self.system_prompt.is_empty() {
            cmd.arg("--append-system-prompt").arg(&self.system_prompt);
        }
        if let Some(ref dir) = self.workdir {
            cmd.current_dir(dir);
        }

        let status = cmd
            .status()
            .map_err(|e| AgentError::SpawnFailed(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(AgentError::ExitedNonZero {
                code: status.code().unwrap_or(-1),
                stderr: String::new(),
            })
        }
    }
}

/// Parse the agent's JSON envelope: `type` must equal "result".
pub fn parse_reply(stdout: &str) -> Result<AgentReply, AgentError> {
    let envelope: Envelope = serde_json::from_str(stdout.trim())
        .map_err(|e| AgentError::OutputUnparseable(e.to_string()))?;
    if envelope.kind != "result" {
        return Err(AgentError::WrongType { got: envelope.kind });
    }
    Ok(envelope.reply)
}

fn read_to_string_lossy(mut reader: impl Read) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}
