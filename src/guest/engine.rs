//! Agent engine adapter
//!
//! The daemon does not reason; it drives an engine and relays what the
//! engine asks for. `ProcessEngine` runs an external command that speaks
//! JSON lines on stdin/stdout:
//!
//! ```text
//!   daemon → engine                      engine → daemon
//!   ──────────────────────────────       ─────────────────────────────────
//!   {"type":"invoke", ...}               {"type":"event","event":{...}}
//!   {"type":"can_use_tool_result", ...}  {"type":"can_use_tool","id",...}
//!   {"type":"host_tool_result", ...}     {"type":"host_tool","id",...}
//! ```
//!
//! The engine exits when the turn is over.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::gate::ToolDecision;
use crate::protocol::HostToolResponse;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no engine command configured")]
    NotConfigured,

    #[error("failed to start engine `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("engine I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("engine protocol error: {0}")]
    Protocol(#[from] serde_json::Error),

    #[error("engine exited with {0}")]
    Exited(std::process::ExitStatus),

    #[error("engine run was cancelled")]
    Cancelled,
}

/// One engine turn
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineInvocation {
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Engine session to resume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub cwd: PathBuf,
    #[serde(skip)]
    pub env: BTreeMap<String, String>,
    /// Tools the host executes on the engine's behalf
    pub host_tools: Vec<String>,
}

/// What the engine can ask of the daemon during a turn
#[async_trait]
pub trait EngineCallbacks: Send + Sync {
    /// An engine event, in emission order
    async fn on_event(&self, event: Value);

    /// Gate a tool call
    async fn can_use_tool(&self, tool: &str, input: Value) -> ToolDecision;

    /// Execute a host-side tool
    async fn host_tool(&self, tool: &str, input: Value) -> HostToolResponse;
}

#[async_trait]
pub trait AgentEngine: Send + Sync {
    /// Run one turn to completion
    ///
    /// Returns once the engine has finished emitting events. Cancelling
    /// `cancel` stops the engine and returns `EngineError::Cancelled`.
    async fn run(
        &self,
        invocation: EngineInvocation,
        callbacks: Arc<dyn EngineCallbacks>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError>;
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ToEngine<'a> {
    Invoke(&'a EngineInvocation),
    CanUseToolResult {
        id: String,
        #[serde(flatten)]
        decision: ToolDecision,
    },
    HostToolResult {
        id: String,
        #[serde(flatten)]
        response: HostToolResponse,
    },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum FromEngine {
    Event {
        event: Value,
    },
    #[serde(rename_all = "camelCase")]
    CanUseTool {
        id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(rename_all = "camelCase")]
    HostTool {
        id: String,
        tool_name: String,
        #[serde(default)]
        input: Value,
    },
}

/// Engine running as a child process
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    command: Vec<String>,
}

impl ProcessEngine {
    /// # Arguments
    /// * `command` - program followed by its arguments
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl AgentEngine for ProcessEngine {
    async fn run(
        &self,
        invocation: EngineInvocation,
        callbacks: Arc<dyn EngineCallbacks>,
        cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        let (program, args) = self.command.split_first().ok_or(EngineError::NotConfigured)?;

        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(&invocation.env)
            .current_dir(&invocation.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| EngineError::Spawn {
                program: program.clone(),
                source,
            })?;
        debug!(program = %program, pid = ?child.id(), "engine started");

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("engine stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("engine stdout not captured"))?;

        // Tool answers arrive from concurrent tasks; one writer keeps lines whole
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let invoke = serde_json::to_string(&ToEngine::Invoke(&invocation))? + "\n";
        let _ = tx.send(invoke);
        let writer = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    debug!(error = %e, "engine stdin closed");
                    break;
                }
                let _ = stdin.flush().await;
            }
        });

        let mut tool_calls = JoinSet::new();
        let mut lines = BufReader::new(stdout).lines();
        let read_result: Result<(), EngineError> = loop {
            let line = tokio::select! {
                _ = cancel.cancelled() => break Err(EngineError::Cancelled),
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e.into()),
            };
            if line.trim().is_empty() {
                continue;
            }
            let message: FromEngine = match serde_json::from_str(&line) {
                Ok(m) => m,
                Err(e) => {
                    warn!(error = %e, "ignoring unparseable engine output");
                    continue;
                }
            };

            match message {
                FromEngine::Event { event } => callbacks.on_event(event).await,
                FromEngine::CanUseTool {
                    id,
                    tool_name,
                    input,
                } => {
                    let callbacks = callbacks.clone();
                    let tx = tx.clone();
                    tool_calls.spawn(async move {
                        let decision = callbacks.can_use_tool(&tool_name, input).await;
                        send_to_engine(&tx, &ToEngine::CanUseToolResult { id, decision });
                    });
                }
                FromEngine::HostTool {
                    id,
                    tool_name,
                    input,
                } => {
                    let callbacks = callbacks.clone();
                    let tx = tx.clone();
                    tool_calls.spawn(async move {
                        let response = callbacks.host_tool(&tool_name, input).await;
                        send_to_engine(&tx, &ToEngine::HostToolResult { id, response });
                    });
                }
            }
        };

        tool_calls.abort_all();
        drop(tx);
        writer.abort();

        if let Err(e) = read_result {
            if let Err(kill_err) = child.kill().await {
                debug!(error = %kill_err, "engine already gone");
            }
            return Err(e);
        }

        let status = child.wait().await?;
        if status.success() {
            Ok(())
        } else {
            Err(EngineError::Exited(status))
        }
    }
}

fn send_to_engine(tx: &mpsc::UnboundedSender<String>, message: &ToEngine<'_>) {
    match serde_json::to_string(message) {
        Ok(line) => {
            let _ = tx.send(line + "\n");
        }
        Err(e) => warn!(error = %e, "failed to encode engine reply"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Value>>,
        tools: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EngineCallbacks for Recorder {
        async fn on_event(&self, event: Value) {
            self.events.lock().unwrap().push(event);
        }

        async fn can_use_tool(&self, tool: &str, _input: Value) -> ToolDecision {
            self.tools.lock().unwrap().push(tool.to_string());
            ToolDecision::Deny {
                message: "no".into(),
            }
        }

        async fn host_tool(&self, _tool: &str, _input: Value) -> HostToolResponse {
            HostToolResponse::ok(json!({}))
        }
    }

    fn invocation(dir: &std::path::Path) -> EngineInvocation {
        EngineInvocation {
            prompt: "hello".into(),
            system_prompt: None,
            session_id: None,
            cwd: dir.to_path_buf(),
            env: BTreeMap::from([("PATH".to_string(), "/usr/bin:/bin".to_string())]),
            host_tools: vec![],
        }
    }

    #[tokio::test]
    async fn test_events_relayed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"read line; echo '{"type":"event","event":{"type":"system"}}'; echo 'noise'; echo '{"type":"event","event":{"type":"result","subtype":"success"}}'"#;
        let engine = ProcessEngine::new(vec!["/bin/sh".into(), "-c".into(), script.into()]);
        let recorder = Arc::new(Recorder::default());

        engine
            .run(invocation(dir.path()), recorder.clone(), CancellationToken::new())
            .await
            .unwrap();

        let events = recorder.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1]["type"], "result");
    }

    #[tokio::test]
    async fn test_tool_decision_written_back() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"read invoke; echo '{"type":"can_use_tool","id":"t1","toolName":"Bash","input":{}}'; read answer; printf '{"type":"event","event":%s}\n' "$answer""#;
        let engine = ProcessEngine::new(vec!["/bin/sh".into(), "-c".into(), script.into()]);
        let recorder = Arc::new(Recorder::default());

        engine
            .run(invocation(dir.path()), recorder.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*recorder.tools.lock().unwrap(), vec!["Bash".to_string()]);
        let events = recorder.events.lock().unwrap();
        assert_eq!(events[0]["type"], "can_use_tool_result");
        assert_eq!(events[0]["id"], "t1");
        assert_eq!(events[0]["behavior"], "deny");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(vec!["/bin/sh".into(), "-c".into(), "exit 3".into()]);
        let err = engine
            .run(invocation(dir.path()), Arc::new(Recorder::default()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Exited(_)));
    }

    #[tokio::test]
    async fn test_cancel_stops_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = ProcessEngine::new(vec!["/bin/sh".into(), "-c".into(), "sleep 30".into()]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let err = engine
            .run(invocation(dir.path()), Arc::new(Recorder::default()), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessEngine::new(vec![])
            .run(invocation(dir.path()), Arc::new(Recorder::default()), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotConfigured));
    }
}
