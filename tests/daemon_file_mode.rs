//! Guest daemon and host session driver sharing one ipc directory
//!
//! The directory stands in for the 9p share; a scripted engine replaces the
//! real agent so the full request → gate → permission → result path runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use sandvisor::bridge::{FileBridge, HeartbeatMonitor, HostBridge, Liveness};
use sandvisor::guest::{
    AgentEngine, Daemon, DaemonConfig, EngineCallbacks, EngineError, EngineInvocation,
    TransportChoice,
};
use sandvisor::protocol::{AgentRequest, IpcLayout, StreamEvent, TransportMode};
use sandvisor::session::{FixedPermission, LocalHostTools, SessionDriver};

/// Deletes a build dir, lists memories, then finishes
struct ScriptedEngine;

#[async_trait]
impl AgentEngine for ScriptedEngine {
    async fn run(
        &self,
        invocation: EngineInvocation,
        callbacks: Arc<dyn EngineCallbacks>,
        _cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        callbacks
            .on_event(json!({"type": "system", "session_id": "engine-1"}))
            .await;
        let decision = callbacks
            .can_use_tool("Bash", json!({"command": "rm -rf ./build"}))
            .await;
        callbacks
            .on_event(json!({"type": "tool", "allowed": decision.is_allow()}))
            .await;
        let memories = callbacks.host_tool("memory_list", json!({})).await;
        callbacks
            .on_event(json!({"type": "host_tool", "success": memories.success, "result": memories.result}))
            .await;
        callbacks
            .on_event(json!({
                "type": "result",
                "subtype": "success",
                "result": format!("done: {}", invocation.prompt),
                "session_id": "engine-1",
            }))
            .await;
        Ok(())
    }
}

/// Asks to read outside the workspace when told to, otherwise answers at once
struct PromptEngine;

#[async_trait]
impl AgentEngine for PromptEngine {
    async fn run(
        &self,
        invocation: EngineInvocation,
        callbacks: Arc<dyn EngineCallbacks>,
        _cancel: CancellationToken,
    ) -> Result<(), EngineError> {
        if invocation.prompt == "read secrets" {
            let decision = callbacks
                .can_use_tool("Read", json!({"file_path": "/etc/passwd"}))
                .await;
            callbacks
                .on_event(json!({"type": "tool", "allowed": decision.is_allow()}))
                .await;
        }
        callbacks
            .on_event(json!({"type": "result", "subtype": "success", "result": "ok"}))
            .await;
        Ok(())
    }
}

struct Harness {
    ipc: tempfile::TempDir,
    host: tempfile::TempDir,
    work: tempfile::TempDir,
    shutdown: CancellationToken,
    daemon: tokio::task::JoinHandle<()>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(Arc::new(ScriptedEngine)).await
    }

    async fn start_with(engine: Arc<dyn AgentEngine>) -> Self {
        let ipc = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let config = DaemonConfig {
            ipc_dir: ipc.path().to_path_buf(),
            work_dir: work.path().to_path_buf(),
            transport: TransportChoice::File,
            heartbeat_interval: Duration::from_millis(100),
            request_poll: Duration::from_millis(20),
            response_poll: Duration::from_millis(20),
            permission_timeout: Duration::from_secs(5),
            ..DaemonConfig::default()
        };
        let daemon = Arc::new(Daemon::new(config, engine));
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let daemon = tokio::spawn(async move {
            daemon.run(token).await.unwrap();
        });
        Self {
            ipc,
            host,
            work,
            shutdown,
            daemon,
        }
    }

    async fn bridge(&self) -> Arc<dyn HostBridge> {
        Arc::new(
            FileBridge::open(IpcLayout::new(self.ipc.path()), self.work.path().to_path_buf())
                .await
                .unwrap(),
        )
    }

    fn request(&self, id: &str) -> AgentRequest {
        self.request_with_prompt(id, "clean the build")
    }

    fn request_with_prompt(&self, id: &str, prompt: &str) -> AgentRequest {
        serde_json::from_value(json!({
            "id": id,
            "cwd": self.work.path(),
            "prompt": prompt,
            "workspaceRoot": self.work.path(),
            "hostWorkspaceRoot": "/Users/dev/project",
        }))
        .unwrap()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.daemon.await.unwrap();
    }
}

#[tokio::test]
async fn test_turn_with_denied_delete() {
    let harness = Harness::start().await;
    let bridge = harness.bridge().await;
    let heartbeat = bridge.wait_until_ready(Duration::from_secs(5)).await.unwrap();
    assert_eq!(heartbeat.transport, TransportMode::File);

    let host_tools = Arc::new(LocalHostTools::open(harness.host.path()).unwrap());
    host_tools.memories().add("prefers tabs").unwrap();

    let driver = SessionDriver::new(bridge, Arc::new(FixedPermission::deny_all()), host_tools)
        .with_poll_interval(Duration::from_millis(20));

    let mut events: Vec<Value> = Vec::new();
    let outcome = tokio::time::timeout(
        Duration::from_secs(20),
        driver.run_turn(&harness.request("turn-1"), &CancellationToken::new(), |e| {
            events.push(e.clone())
        }),
    )
    .await
    .unwrap()
    .unwrap();

    let kinds: Vec<&str> = events.iter().filter_map(|e| e["type"].as_str()).collect();
    assert_eq!(kinds, vec!["system", "tool", "host_tool", "result"]);
    assert_eq!(events[1]["allowed"], false);
    assert_eq!(events[2]["success"], true);
    assert_eq!(events[2]["result"]["memories"][0]["content"], "prefers tabs");
    assert_eq!(outcome.engine_session_id.as_deref(), Some("engine-1"));
    assert!(!outcome.is_error());

    // Processed request file is gone
    let layout = IpcLayout::new(harness.ipc.path());
    assert!(!layout.request_path("turn-1").unwrap().exists());

    harness.stop().await;
}

#[tokio::test]
async fn test_approved_delete_runs() {
    let harness = Harness::start().await;
    let bridge = harness.bridge().await;
    bridge.wait_until_ready(Duration::from_secs(5)).await.unwrap();

    let host_tools = Arc::new(LocalHostTools::open(harness.host.path()).unwrap());
    let driver = SessionDriver::new(bridge, Arc::new(FixedPermission::allow_all()), host_tools)
        .with_poll_interval(Duration::from_millis(20));

    let mut events: Vec<Value> = Vec::new();
    tokio::time::timeout(
        Duration::from_secs(20),
        driver.run_turn(&harness.request("turn-2"), &CancellationToken::new(), |e| {
            events.push(e.clone())
        }),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(events[1]["allowed"], true);
    harness.stop().await;
}

#[tokio::test]
async fn test_duplicate_request_id_skipped() {
    let harness = Harness::start().await;
    let bridge = harness.bridge().await;
    bridge.wait_until_ready(Duration::from_secs(5)).await.unwrap();

    let host_tools = Arc::new(LocalHostTools::open(harness.host.path()).unwrap());
    let driver = SessionDriver::new(bridge.clone(), Arc::new(FixedPermission::deny_all()), host_tools)
        .with_poll_interval(Duration::from_millis(20));
    let request = harness.request("turn-3");
    tokio::time::timeout(
        Duration::from_secs(20),
        driver.run_turn(&request, &CancellationToken::new(), |_| {}),
    )
    .await
    .unwrap()
    .unwrap();

    let layout = IpcLayout::new(harness.ipc.path());
    let before = layout.read_stream("turn-3", 0).await.unwrap();

    // Same id again: the daemon drops it without running the engine
    bridge.submit_request(&request).await.unwrap();
    let request_path = layout.request_path("turn-3").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while request_path.exists() {
        assert!(tokio::time::Instant::now() < deadline, "duplicate was never consumed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let after = layout.read_stream("turn-3", 0).await.unwrap();
    assert_eq!(before.events.len(), after.events.len());

    harness.stop().await;
}

#[tokio::test]
async fn test_heartbeat_advances_and_goes_stale() {
    let harness = Harness::start().await;
    let bridge = harness.bridge().await;
    let first = bridge.wait_until_ready(Duration::from_secs(5)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    let second = bridge.read_heartbeat().await.unwrap();
    assert!(second.timestamp > first.timestamp);
    assert_eq!(second.pid, std::process::id());

    let mut monitor = HeartbeatMonitor::new(Duration::from_millis(100));
    assert_eq!(monitor.check(bridge.as_ref()).await, Liveness::Alive);

    harness.stop().await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(matches!(
        monitor.check(bridge.as_ref()).await,
        Liveness::Unresponsive { .. }
    ));
}

async fn wait_for_events<F>(bridge: &dyn HostBridge, request_id: &str, done: F) -> Vec<StreamEvent>
where
    F: Fn(&[StreamEvent]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let read = bridge.read_stream(request_id, 0).await.unwrap();
        if done(&read.events) {
            return read.events;
        }
        assert!(tokio::time::Instant::now() < deadline, "{request_id} never got there");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_pending_permission_does_not_block_other_requests() {
    let harness = Harness::start_with(Arc::new(PromptEngine)).await;
    let bridge = harness.bridge().await;
    bridge.wait_until_ready(Duration::from_secs(5)).await.unwrap();

    // Nobody answers this one; it parks until the 5s permission timeout
    bridge
        .submit_request(&harness.request_with_prompt("slow", "read secrets"))
        .await
        .unwrap();
    wait_for_events(bridge.as_ref(), "slow", |events| {
        events
            .iter()
            .any(|e| matches!(e, StreamEvent::PermissionRequest(_)))
    })
    .await;

    let started = tokio::time::Instant::now();
    bridge
        .submit_request(&harness.request_with_prompt("quick", "hello"))
        .await
        .unwrap();
    wait_for_events(bridge.as_ref(), "quick", |events| {
        events.iter().any(StreamEvent::is_terminal)
    })
    .await;
    assert!(started.elapsed() < Duration::from_secs(3));

    let slow = bridge.read_stream("slow", 0).await.unwrap();
    assert!(!slow.events.iter().any(StreamEvent::is_terminal));

    harness.stop().await;
}
