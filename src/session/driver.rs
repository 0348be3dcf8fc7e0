//! Drives one agent turn from the host
//!
//! ```text
//!   submit_request ──► guest
//!        │
//!        ▼
//!   tail streams/<id>.log ──┬─ sdk_event          → caller
//!        ▲                  ├─ permission_request → PermissionHandler ─► send_permission_response
//!        │ poll             ├─ host_tool_request  → HostToolHandler   ─► send_host_tool_response
//!        └──────────────────┴─ result             → done
//! ```
//!
//! Permission and host-tool requests are answered on their own tasks so a
//! slow user prompt never stalls the stream. Every permission wait is
//! bounded and defaults to deny.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{HostToolHandler, PermissionHandler};
use crate::bridge::{BridgeError, HeartbeatMonitor, HostBridge, Liveness};
use crate::config::BridgeConfig;
use crate::metrics::PERMISSION_DECISIONS;
use crate::protocol::{
    AgentRequest, HostToolRequest, HostToolResponse, PendingOutcome, PendingRegistry,
    PermissionRequest, PermissionResponse, StreamEvent, HEARTBEAT_INTERVAL, PERMISSION_TIMEOUT,
};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error("guest stopped responding ({stale_for:?} without a heartbeat)")]
    Unresponsive { stale_for: Duration },

    #[error("guest never sent a heartbeat (waited {waited:?})")]
    NoHeartbeat { waited: Duration },
}

/// What a finished turn produced
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// Number of engine events forwarded
    pub events: usize,
    /// The terminal `result` event, if the turn completed
    pub result: Option<Value>,
    /// Engine session id seen in the events, for resuming
    pub engine_session_id: Option<String>,
    pub cancelled: bool,
}

impl TurnOutcome {
    pub fn is_error(&self) -> bool {
        self.result
            .as_ref()
            .and_then(|r| r.get("is_error"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

pub struct SessionDriver {
    bridge: Arc<dyn HostBridge>,
    permissions: Arc<dyn PermissionHandler>,
    host_tools: Arc<dyn HostToolHandler>,
    pending: PendingRegistry<PermissionResponse>,
    permission_timeout: Duration,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    ready_timeout: Duration,
}

impl SessionDriver {
    pub fn new(
        bridge: Arc<dyn HostBridge>,
        permissions: Arc<dyn PermissionHandler>,
        host_tools: Arc<dyn HostToolHandler>,
    ) -> Self {
        Self {
            bridge,
            permissions,
            host_tools,
            pending: PendingRegistry::new(),
            permission_timeout: PERMISSION_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: HEARTBEAT_INTERVAL,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }

    /// Take timeouts and intervals from `[bridge]` config
    pub fn with_config(mut self, config: &BridgeConfig) -> Self {
        self.permission_timeout = config.permission_timeout();
        self.poll_interval = config.poll_interval();
        self.heartbeat_interval = config.heartbeat_interval();
        self.ready_timeout = config.ready_timeout();
        self
    }

    /// Give up on a turn whose guest has not sent a single heartbeat by then
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn with_permission_timeout(mut self, timeout: Duration) -> Self {
        self.permission_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn bridge(&self) -> &Arc<dyn HostBridge> {
        &self.bridge
    }

    /// Answer an outstanding permission exchange from outside the handler
    ///
    /// Returns false if `permission_id` is not waiting (already answered,
    /// timed out, or unknown).
    pub fn resolve_permission(&self, permission_id: &str, response: PermissionResponse) -> bool {
        self.pending.resolve(permission_id, response)
    }

    /// Submit `request` and follow its stream until the terminal event
    ///
    /// `on_event` receives every engine event in order. Cancelling `cancel`
    /// ends the turn early and denies any outstanding permission requests.
    pub async fn run_turn<F>(
        &self,
        request: &AgentRequest,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<TurnOutcome, SessionError>
    where
        F: FnMut(&Value) + Send,
    {
        self.bridge.submit_request(request).await?;
        info!(request_id = %request.id, transport = ?self.bridge.kind(), "turn started");

        let turn_cancel = cancel.child_token();
        let mut helpers = JoinSet::new();
        let mut monitor = HeartbeatMonitor::new(self.heartbeat_interval);
        let mut outcome = TurnOutcome::default();
        let mut offset = 0;
        let mut warned_degraded = false;
        let started = tokio::time::Instant::now();

        let result = loop {
            if cancel.is_cancelled() {
                outcome.cancelled = true;
                break Ok(());
            }

            let read = match self.bridge.read_stream(&request.id, offset).await {
                Ok(read) => read,
                Err(e) => break Err(e.into()),
            };
            offset = read.next_offset;
            let progressed = !read.events.is_empty();
            let mut finished = false;

            for event in read.events {
                let terminal = event.is_terminal();
                match event {
                    StreamEvent::SdkEvent { event } => {
                        outcome.events += 1;
                        if let Some(id) = event.get("session_id").and_then(Value::as_str) {
                            outcome.engine_session_id = Some(id.to_string());
                        }
                        on_event(&event);
                        if terminal {
                            outcome.result = Some(event);
                            finished = true;
                            break;
                        }
                    }
                    StreamEvent::PermissionRequest(permission) => {
                        debug!(permission_id = %permission.request_id, tool = %permission.tool_name, "permission requested");
                        helpers.spawn(answer_permission(
                            self.bridge.clone(),
                            self.permissions.clone(),
                            self.pending.clone(),
                            permission,
                            self.permission_timeout,
                            turn_cancel.clone(),
                        ));
                    }
                    StreamEvent::HostToolRequest(call) => {
                        helpers.spawn(answer_host_tool(
                            self.bridge.clone(),
                            self.host_tools.clone(),
                            call,
                            self.permission_timeout,
                        ));
                    }
                }
            }
            if finished {
                break Ok(());
            }

            if !progressed {
                match monitor.check(self.bridge.as_ref()).await {
                    Liveness::Unresponsive { stale_for } => {
                        break Err(SessionError::Unresponsive { stale_for });
                    }
                    Liveness::Waiting if started.elapsed() > self.ready_timeout => {
                        break Err(SessionError::NoHeartbeat {
                            waited: started.elapsed(),
                        });
                    }
                    Liveness::Degraded if !warned_degraded => {
                        warn!(request_id = %request.id, "guest daemon is degraded; waiting for it to recover");
                        warned_degraded = true;
                    }
                    _ => {}
                }
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        };

        if outcome.cancelled || result.is_err() {
            // Let outstanding permission waits resolve to deny and be sent
            turn_cancel.cancel();
            while helpers.join_next().await.is_some() {}
        } else {
            helpers.abort_all();
        }

        result?;
        info!(
            request_id = %request.id,
            events = outcome.events,
            cancelled = outcome.cancelled,
            is_error = outcome.is_error(),
            "turn finished"
        );
        Ok(outcome)
    }
}

async fn answer_permission(
    bridge: Arc<dyn HostBridge>,
    handler: Arc<dyn PermissionHandler>,
    pending: PendingRegistry<PermissionResponse>,
    request: PermissionRequest,
    timeout: Duration,
    cancel: CancellationToken,
) {
    let id = request.request_id.clone();
    let rx = pending.insert(id.clone());

    let decider = {
        let pending = pending.clone();
        let request = request.clone();
        tokio::spawn(async move {
            let response = handler.decide(&request).await;
            pending.resolve(&request.request_id, response);
        })
    };

    let outcome = pending.wait(&id, rx, timeout, &cancel).await;
    decider.abort();

    let (response, label) = match outcome {
        PendingOutcome::Resolved(response) => {
            let label = if response.is_allow() { "allow" } else { "deny" };
            (response, label)
        }
        PendingOutcome::TimedOut => {
            warn!(permission_id = %id, tool = %request.tool_name, "permission request timed out; denying");
            (PermissionResponse::deny("Permission request timed out"), "timeout")
        }
        PendingOutcome::Cancelled => (PermissionResponse::deny("Session was aborted"), "aborted"),
    };
    PERMISSION_DECISIONS.with_label_values(&["host", label]).inc();

    if let Err(e) = bridge.send_permission_response(&id, &response).await {
        warn!(permission_id = %id, error = %e, "failed to deliver permission response");
    }
}

async fn answer_host_tool(
    bridge: Arc<dyn HostBridge>,
    handler: Arc<dyn HostToolHandler>,
    request: HostToolRequest,
    timeout: Duration,
) {
    let response = match tokio::time::timeout(timeout, handler.call(&request)).await {
        Ok(response) => response,
        Err(_) => HostToolResponse::failure(format!("host tool `{}` timed out", request.tool_name)),
    };
    if let Err(e) = bridge
        .send_host_tool_response(&request.request_id, &response)
        .await
    {
        warn!(tool_request_id = %request.request_id, error = %e, "failed to deliver host tool response");
    }
}
