//! Guest daemon main loop
//!
//! ```text
//!   probe ─► transport ─► serve ─┬─ heartbeat tick  → write_heartbeat
//!     ▲                          ├─ sync tick       → sync_files (socket)
//!     │                          ├─ reprobe tick    → probe again (degraded)
//!     └────── switch ────────────┤
//!                                └─ next_request    → process_request (own task)
//! ```
//!
//! Every request runs in its own task, so a turn parked on a permission
//! answer holds up neither the timers nor other requests. A request id runs
//! at most once; repeats are dropped as duplicates.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::config::DaemonConfig;
use super::engine::{AgentEngine, EngineCallbacks, EngineError, EngineInvocation};
use super::env::{normalized_env, GuestIdentity};
use super::file_transport::FileTransport;
use super::gate::{PermissionAsker, ToolDecision, ToolGate, ABORTED_MESSAGE};
use super::probe::{probe_transport, ProbeOutcome, ProbeState};
use super::socket_transport::SocketTransport;
use super::transport::{GuestTransport, TransportError};
use crate::metrics::DAEMON_REQUESTS;
use crate::protocol::{
    AgentRequest, DaemonStatus, Heartbeat, HostToolRequest, HostToolResponse, IpcLayout,
    PendingOutcome, PermissionRequest, PermissionResponse, StreamEvent, TransportMode,
};
use crate::session::host_tools::HOST_TOOL_NAMES;
use crate::session::store::now_millis;

/// Request ids remembered for duplicate suppression
pub const RECENT_ID_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("no transport could be opened: {0}")]
    Transport(#[from] TransportError),
}

/// Bounded set of recently seen request ids, oldest evicted first
#[derive(Debug)]
pub struct RecentIds {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl RecentIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id`; false if it was already present
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

enum ServeExit {
    Shutdown,
    Switch(ProbeOutcome),
    Closed,
}

pub struct Daemon {
    config: DaemonConfig,
    engine: Arc<dyn AgentEngine>,
    identity: GuestIdentity,
    started: Instant,
    recent: Mutex<RecentIds>,
}

impl Daemon {
    pub fn new(config: DaemonConfig, engine: Arc<dyn AgentEngine>) -> Self {
        Self {
            config,
            engine,
            identity: GuestIdentity::current(),
            started: Instant::now(),
            recent: Mutex::new(RecentIds::new(RECENT_ID_CAPACITY)),
        }
    }

    /// Run until `shutdown` fires
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), DaemonError> {
        info!(
            ipc_dir = %self.config.ipc_dir.display(),
            work_dir = %self.config.work_dir.display(),
            pid = std::process::id(),
            "guest daemon starting"
        );

        let mut state = probe_transport(&self.config, self.config.device_attempts()).await;
        loop {
            let transport = self.open_transport(&state).await?;
            info!(transport = ?transport.mode(), "serving");
            match self.clone().serve(transport, &shutdown).await {
                ServeExit::Shutdown => {
                    info!("guest daemon stopped");
                    return Ok(());
                }
                ServeExit::Switch(outcome) => {
                    info!(outcome = ?outcome, "transport appeared; switching");
                    state = ProbeState::Ready(outcome);
                }
                ServeExit::Closed => {
                    warn!("transport closed; probing again");
                    state = probe_transport(&self.config, self.config.device_attempts()).await;
                }
            }
        }
    }

    /// Build the transport for a probe result
    ///
    /// A transport that fails to open falls back to degraded mode.
    pub async fn open_transport(&self, state: &ProbeState) -> Result<Arc<dyn GuestTransport>, DaemonError> {
        let opened: Result<Arc<dyn GuestTransport>, TransportError> = match state {
            ProbeState::Ready(ProbeOutcome::SharedFs) => self.file_transport(TransportMode::File).await,
            ProbeState::Ready(ProbeOutcome::Socket { device }) => SocketTransport::open(
                device,
                self.config.work_dir.clone(),
                self.config.permission_timeout,
            )
            .await
            .map(|t| Arc::new(t) as Arc<dyn GuestTransport>),
            _ => self.file_transport(TransportMode::Degraded).await,
        };
        match opened {
            Ok(transport) => Ok(transport),
            Err(e) => {
                error!(error = %e, state = ?state, "failed to open transport; running degraded");
                Ok(self.file_transport(TransportMode::Degraded).await?)
            }
        }
    }

    async fn file_transport(&self, mode: TransportMode) -> Result<Arc<dyn GuestTransport>, TransportError> {
        let transport = FileTransport::open(
            IpcLayout::new(&self.config.ipc_dir),
            mode,
            self.config.request_poll,
            self.config.response_poll,
            self.config.permission_timeout,
        )
        .await?;
        Ok(Arc::new(transport))
    }

    async fn serve(self: Arc<Self>, transport: Arc<dyn GuestTransport>, shutdown: &CancellationToken) -> ServeExit {
        let mode = transport.mode();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        let mut sync = tokio::time::interval(self.config.sync_interval);
        let mut reprobe = tokio::time::interval(self.config.reprobe_interval);
        reprobe.reset();

        let mut in_flight: JoinSet<()> = JoinSet::new();
        let request_cancel = shutdown.child_token();

        let exit = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break ServeExit::Shutdown,

                _ = heartbeat.tick() => self.beat(transport.as_ref()).await,

                _ = sync.tick(), if mode == TransportMode::Socket => {
                    transport.sync_files(false).await;
                }

                _ = reprobe.tick(), if mode == TransportMode::Degraded => {
                    error!("no request transport available; re-probing");
                    if let ProbeState::Ready(outcome) = probe_transport(&self.config, 1).await {
                        break ServeExit::Switch(outcome);
                    }
                }

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "request task failed");
                    }
                }

                request = transport.next_request() => {
                    let Some(request) = request else { break ServeExit::Closed };
                    let fresh = self
                        .recent
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(&request.id);
                    if !fresh {
                        warn!(request_id = %request.id, "duplicate request id; skipping");
                        DAEMON_REQUESTS.with_label_values(&["duplicate"]).inc();
                        transport.acknowledge(&request.id).await;
                        continue;
                    }
                    let span = info_span!("request", request_id = %request.id);
                    let daemon = self.clone();
                    let transport = transport.clone();
                    let cancel = request_cancel.child_token();
                    in_flight.spawn(
                        async move { daemon.process_request(transport, request, cancel).await }
                            .instrument(span),
                    );
                    debug!(in_flight = in_flight.len(), "request started");
                }
            }
        };

        request_cancel.cancel();
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "request task failed");
            }
        }
        exit
    }

    async fn beat(&self, transport: &dyn GuestTransport) {
        let mode = transport.mode();
        let heartbeat = Heartbeat {
            timestamp: now_millis(),
            pid: std::process::id(),
            uptime: self.started.elapsed().as_secs(),
            ipc_mounted: transport.ipc_mounted(),
            transport: mode,
            status: if mode == TransportMode::Degraded {
                DaemonStatus::Degraded
            } else {
                DaemonStatus::Ready
            },
        };
        if let Err(e) = transport.write_heartbeat(&heartbeat).await {
            warn!(error = %e, "failed to write heartbeat");
        }
    }

    /// Run one request end to end
    ///
    /// The terminal `result` event is held until the forced resync is done,
    /// so the host never sees the end of the turn before its files.
    pub async fn process_request(
        self: Arc<Self>,
        transport: Arc<dyn GuestTransport>,
        request: AgentRequest,
        cancel: CancellationToken,
    ) {
        let started = Instant::now();
        info!(cwd = %request.cwd.display(), resume = ?request.session_id, "processing request");

        let env = normalized_env(&request.env, &self.identity, &std::env::temp_dir());
        let callbacks = Arc::new(RequestCallbacks {
            request_id: request.id.clone(),
            transport: transport.clone(),
            gate: ToolGate::new(&request, Some(self.identity.home.clone())),
            cancel: cancel.clone(),
            terminal: Mutex::new(None),
        });

        let invocation = EngineInvocation {
            prompt: request.prompt.clone(),
            system_prompt: request.system_prompt.clone(),
            session_id: request.session_id.clone(),
            cwd: request.cwd.clone(),
            env,
            host_tools: HOST_TOOL_NAMES.iter().map(|s| s.to_string()).collect(),
        };

        let result = self
            .engine
            .run(invocation, callbacks.clone(), cancel.clone())
            .await;

        let held = callbacks
            .terminal
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let (terminal, outcome) = match (result, held) {
            (Ok(()), Some(event)) => (event, "success"),
            (Ok(()), None) => (
                StreamEvent::engine_error("engine finished without a result"),
                "error",
            ),
            (Err(EngineError::Cancelled), _) => (StreamEvent::engine_error(ABORTED_MESSAGE), "error"),
            (Err(e), _) => {
                error!(error = %e, "engine failed");
                (StreamEvent::engine_error(e.to_string()), "error")
            }
        };

        let synced = transport.sync_files(true).await;
        if let Err(e) = transport.emit(&request.id, &terminal).await {
            warn!(error = %e, "failed to emit terminal event");
        }
        transport.acknowledge(&request.id).await;
        DAEMON_REQUESTS.with_label_values(&[outcome]).inc();
        info!(outcome, synced, elapsed_ms = started.elapsed().as_millis() as u64, "request finished");
    }
}

/// Engine callbacks bound to one request
struct RequestCallbacks {
    request_id: String,
    transport: Arc<dyn GuestTransport>,
    gate: ToolGate,
    cancel: CancellationToken,
    /// Terminal event held back until the turn's files are synced
    terminal: Mutex<Option<StreamEvent>>,
}

#[async_trait]
impl EngineCallbacks for RequestCallbacks {
    async fn on_event(&self, event: Value) {
        let event = StreamEvent::sdk(event);
        if event.is_terminal() {
            *self.terminal.lock().unwrap_or_else(|e| e.into_inner()) = Some(event);
            return;
        }
        if let Err(e) = self.transport.emit(&self.request_id, &event).await {
            warn!(error = %e, "failed to forward engine event");
        }
    }

    async fn can_use_tool(&self, tool: &str, input: Value) -> ToolDecision {
        self.gate.check(tool, input, self).await
    }

    async fn host_tool(&self, tool: &str, input: Value) -> HostToolResponse {
        let call = HostToolRequest {
            request_id: Uuid::now_v7().to_string(),
            tool_name: tool.to_string(),
            tool_input: input,
        };
        debug!(tool, tool_request_id = %call.request_id, "calling host tool");
        match self
            .transport
            .await_host_tool(&self.request_id, call, &self.cancel)
            .await
        {
            PendingOutcome::Resolved(response) => response,
            PendingOutcome::TimedOut => HostToolResponse::failure("Host tool request timed out"),
            PendingOutcome::Cancelled => HostToolResponse::failure(ABORTED_MESSAGE),
        }
    }
}

#[async_trait]
impl PermissionAsker for RequestCallbacks {
    async fn ask(&self, permission: PermissionRequest) -> PendingOutcome<PermissionResponse> {
        self.transport
            .await_permission(&self.request_id, permission, &self.cancel)
            .await
    }
}
