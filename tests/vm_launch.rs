//! End-to-end launches against a real hypervisor
//!
//! These need QEMU plus a guest image with `sandvisor-guest` installed:
//!
//! ```text
//! SANDVISOR_CONFIG=~/.sandvisor/config.toml cargo test --test vm_launch -- --ignored
//! ```

use std::time::Duration;

use sandvisor::config::SandvisorConfig;
use sandvisor::protocol::TransportMode;
use sandvisor::runtime::{Provisioner, TransportKind};
use sandvisor::vm::{SessionSpec, SessionVm};

async fn start(transport: Option<TransportKind>) -> (SessionVm, tempfile::TempDir) {
    let mut config = SandvisorConfig::load(None).unwrap();
    config.vm.transport = transport;
    let work = tempfile::tempdir().unwrap();
    let provisioner = Provisioner::new(config.runtime.clone());
    let vm = SessionVm::start(&provisioner, &config, SessionSpec::new(work.path()))
        .await
        .unwrap();
    (vm, work)
}

#[tokio::test]
#[ignore = "Requires QEMU and a provisioned guest image"]
async fn test_guest_reports_heartbeat() {
    let (mut vm, _work) = start(None).await;
    let heartbeat = vm.wait_until_ready(Duration::from_secs(180)).await.unwrap();
    assert_ne!(heartbeat.transport, TransportMode::Degraded);
    vm.stop().await;
}

#[tokio::test]
#[ignore = "Requires QEMU and a provisioned guest image"]
async fn test_socket_session_pushes_workspace() {
    let (mut vm, work) = start(Some(TransportKind::Socket)).await;
    std::fs::write(work.path().join("input.txt"), "hello").unwrap();
    let heartbeat = vm.wait_until_ready(Duration::from_secs(180)).await.unwrap();
    assert_eq!(heartbeat.transport, TransportMode::Socket);
    assert_eq!(vm.push_workspace().await.unwrap(), 1);
    vm.stop().await;
}
