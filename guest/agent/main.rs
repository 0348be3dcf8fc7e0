//! Guest daemon - runs inside the session VM
//!
//! Started by the guest init after the 9p shares (if any) are mounted.
//! Logs go to stderr, which init redirects to the serial console.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sandvisor::guest::{Daemon, DaemonConfig, ProcessEngine, TransportChoice};
use sandvisor::protocol::{GUEST_IPC_DIR, GUEST_WORK_DIR};

#[derive(Debug, Parser)]
#[command(name = "sandvisor-guest", version, about = "sandvisor guest daemon")]
struct Args {
    /// ipc share mount point
    #[arg(long, env = "SANDVISOR_IPC_DIR", default_value = GUEST_IPC_DIR)]
    ipc_dir: PathBuf,

    /// Working directory the agent runs in
    #[arg(long, env = "SANDVISOR_WORK_DIR", default_value = GUEST_WORK_DIR)]
    work_dir: PathBuf,

    /// auto, file or socket
    #[arg(long, env = "SANDVISOR_TRANSPORT", default_value = "auto")]
    transport: TransportChoice,

    /// Serial device candidates, tried in order
    #[arg(long = "device", env = "SANDVISOR_DEVICES", value_delimiter = ',')]
    devices: Vec<PathBuf>,

    /// How long to look for the serial device, in milliseconds
    #[arg(long, env = "SANDVISOR_DEVICE_WAIT_MS", default_value_t = 5000)]
    device_wait_ms: u64,

    #[arg(long, env = "SANDVISOR_HEARTBEAT_SECS", default_value_t = 5)]
    heartbeat_secs: u64,

    /// Working-dir scan period in socket mode, in milliseconds
    #[arg(long, env = "SANDVISOR_SYNC_MS", default_value_t = 2000)]
    sync_ms: u64,

    #[arg(long, env = "SANDVISOR_PERMISSION_TIMEOUT_SECS", default_value_t = 60)]
    permission_timeout_secs: u64,

    /// Log as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Engine command and arguments
    #[arg(env = "SANDVISOR_ENGINE", value_delimiter = ' ', required = true, trailing_var_arg = true)]
    engine: Vec<String>,
}

impl Args {
    fn into_config(self) -> DaemonConfig {
        let defaults = DaemonConfig::default();
        DaemonConfig {
            ipc_dir: self.ipc_dir,
            work_dir: self.work_dir,
            transport: self.transport,
            device_paths: if self.devices.is_empty() {
                defaults.device_paths
            } else {
                self.devices
            },
            device_wait: Duration::from_millis(self.device_wait_ms),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
            sync_interval: Duration::from_millis(self.sync_ms.max(100)),
            permission_timeout: Duration::from_secs(self.permission_timeout_secs),
            engine_command: self.engine,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    sandvisor::tracing::init_tracing("sandvisor-guest", None, args.json_logs)
        .map_err(|e| e as Box<dyn std::error::Error>)?;

    let config = args.into_config();
    let engine = Arc::new(ProcessEngine::new(config.engine_command.clone()));
    let daemon = Arc::new(Daemon::new(config, engine));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        signal.cancel();
    });

    daemon.run(shutdown).await?;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = term.recv() => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
