//! Host socket bridge against the guest socket transport over real TCP
//!
//! The hypervisor's chardev is replaced by a direct TCP connection, which
//! is what the guest's serial port looks like from the bridge's side.

use std::time::Duration;

use serde_json::json;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use sandvisor::bridge::{HostBridge, SocketBridge};
use sandvisor::guest::{GuestTransport, SocketTransport};
use sandvisor::protocol::{
    AgentRequest, ConfirmationMode, DaemonStatus, Heartbeat, IpcLayout, PendingOutcome,
    PermissionRequest, PermissionResponse, StreamEvent, TransportMode,
};

struct Channel {
    bridge: SocketBridge,
    guest: std::sync::Arc<SocketTransport>,
    host_work: tempfile::TempDir,
    guest_work: tempfile::TempDir,
    _ipc: tempfile::TempDir,
}

async fn channel() -> Channel {
    let ipc = tempfile::tempdir().unwrap();
    let host_work = tempfile::tempdir().unwrap();
    let guest_work = tempfile::tempdir().unwrap();

    let bridge = SocketBridge::bind(IpcLayout::new(ipc.path()), host_work.path().to_path_buf())
        .await
        .unwrap();
    let stream = TcpStream::connect(("127.0.0.1", bridge.port())).await.unwrap();
    let guest = SocketTransport::from_stream(
        stream,
        guest_work.path().to_path_buf(),
        Duration::from_secs(5),
    );

    Channel {
        bridge,
        guest: std::sync::Arc::new(guest),
        host_work,
        guest_work,
        _ipc: ipc,
    }
}

async fn eventually<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn request(id: &str) -> AgentRequest {
    serde_json::from_value(json!({
        "id": id,
        "cwd": "/workspace",
        "prompt": "list files",
        "workspaceRoot": "/workspace",
        "hostWorkspaceRoot": "/home/dev/project",
    }))
    .unwrap()
}

#[tokio::test]
async fn test_request_reaches_guest() {
    let ch = channel().await;
    ch.bridge.submit_request(&request("r1")).await.unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), ch.guest.next_request())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.id, "r1");
    assert_eq!(received.prompt, "list files");
}

#[tokio::test]
async fn test_heartbeat_and_stream_land_in_ipc_dir() {
    let ch = channel().await;
    let heartbeat = Heartbeat {
        timestamp: 1_700_000_000_000,
        pid: 42,
        uptime: 3,
        ipc_mounted: false,
        transport: TransportMode::Socket,
        status: DaemonStatus::Ready,
    };
    ch.guest.write_heartbeat(&heartbeat).await.unwrap();
    ch.guest
        .emit("r1", &StreamEvent::sdk(json!({"type": "assistant", "text": "hi"})))
        .await
        .unwrap();
    ch.guest
        .emit("r1", &StreamEvent::sdk(json!({"type": "result", "subtype": "success"})))
        .await
        .unwrap();

    let seen = ch.bridge.wait_until_ready(Duration::from_secs(5)).await.unwrap();
    assert_eq!(seen, heartbeat);

    let mut events = Vec::new();
    let mut offset = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while events.len() < 2 && tokio::time::Instant::now() < deadline {
        let read = ch.bridge.read_stream("r1", offset).await.unwrap();
        offset = read.next_offset;
        events.extend(read.events);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(events.len(), 2);
    assert!(events[1].is_terminal());
}

#[tokio::test]
async fn test_permission_answered_through_bridge() {
    let ch = channel().await;
    let guest = ch.guest.clone();
    let waiter = tokio::spawn(async move {
        guest
            .await_permission(
                "r1",
                PermissionRequest {
                    request_id: "perm-1".into(),
                    tool_name: "Read".into(),
                    tool_input: json!({"file_path": "/etc/passwd"}),
                    confirmation_mode: ConfirmationMode::Modal,
                },
                &CancellationToken::new(),
            )
            .await
    });

    // Answer once the request is visible on the host stream
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let read = ch.bridge.read_stream("r1", 0).await.unwrap();
        if let Some(StreamEvent::PermissionRequest(p)) = read.events.first() {
            assert_eq!(p.request_id, "perm-1");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    ch.bridge
        .send_permission_response("perm-1", &PermissionResponse::deny("not allowed"))
        .await
        .unwrap();

    match waiter.await.unwrap() {
        PendingOutcome::Resolved(response) => {
            assert!(!response.is_allow());
            assert_eq!(response.message.as_deref(), Some("not allowed"));
        }
        other => panic!("unexpected outcome {other:?}"),
    }
}

#[tokio::test]
async fn test_large_guest_file_synced_to_host() {
    let ch = channel().await;
    let data: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i * 7 % 251) as u8).collect();
    std::fs::create_dir_all(ch.guest_work.path().join("out")).unwrap();
    std::fs::write(ch.guest_work.path().join("out/report.bin"), &data).unwrap();

    assert_eq!(ch.guest.sync_files(false).await, 1);

    let target = ch.host_work.path().join("out/report.bin");
    eventually(|| std::fs::metadata(&target).map(|m| m.len() == data.len() as u64).unwrap_or(false)).await;
    assert_eq!(std::fs::read(&target).unwrap(), data);

    // Unchanged files are not resent
    assert_eq!(ch.guest.sync_files(false).await, 0);
}

#[tokio::test]
async fn test_pushed_file_reaches_guest_without_echo() {
    let ch = channel().await;
    ch.bridge.push_file("input/data.csv", b"a,b\n1,2\n").await.unwrap();

    let target = ch.guest_work.path().join("input/data.csv");
    eventually(|| target.exists()).await;
    assert_eq!(std::fs::read(&target).unwrap(), b"a,b\n1,2\n");
    assert_eq!(ch.guest.sync_files(false).await, 0);
}

#[tokio::test]
async fn test_traversing_sync_dropped() {
    let ch = channel().await;
    ch.bridge.push_file("../escape.txt", b"x").await.ok();
    ch.bridge.push_file("ok.txt", b"fine").await.unwrap();

    let ok = ch.guest_work.path().join("ok.txt");
    eventually(|| ok.exists()).await;
    assert!(!ch.guest_work.path().parent().unwrap().join("escape.txt").exists());
}
