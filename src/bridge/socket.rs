//! Socket bridge for hosts without shared-directory passthrough
//!
//! The hypervisor connects its virtio-serial chardev to a TCP listener on
//! 127.0.0.1; everything the guest device writes arrives here as JSON lines.
//!
//! ```text
//!   guest ── virtio-serial ── QEMU chardev ── TCP ──► accept loop
//!                                                     ├─ reader: heartbeat → <ipc>/heartbeat
//!                                                     │          stream    → <ipc>/streams/<id>.log
//!                                                     │          file_sync → work dir (guarded)
//!                                                     └─ writer: request, responses, push_file
//! ```
//!
//! Lines sent before the guest connects (or while it reconnects) are held in
//! a backlog and flushed on the next connection.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BridgeError, HostBridge};
use crate::protocol::{
    decode_line, encode_line, split_file, AgentRequest, GuestMessage, HostMessage,
    HostToolReply, HostToolResponse, IpcLayout, OutboundFile, PermissionReply,
    PermissionResponse, TransferAssembler,
};
use crate::runtime::TransportKind;

const GC_INTERVAL: Duration = Duration::from_secs(5);

struct Outbound {
    writer: Option<(u64, OwnedWriteHalf)>,
    backlog: VecDeque<String>,
}

struct Shared {
    layout: IpcLayout,
    assembler: std::sync::Mutex<TransferAssembler>,
    outbound: Mutex<Outbound>,
    connected: AtomicBool,
    generation: AtomicU64,
}

pub struct SocketBridge {
    shared: Arc<Shared>,
    port: u16,
    cancel: CancellationToken,
}

impl SocketBridge {
    /// Bind the listener and start the accept and GC loops
    pub async fn bind(layout: IpcLayout, work_dir: PathBuf) -> Result<Self, BridgeError> {
        layout.create_dirs().await?;
        tokio::fs::create_dir_all(&work_dir).await?;
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener.local_addr()?.port();

        let shared = Arc::new(Shared {
            layout,
            assembler: std::sync::Mutex::new(TransferAssembler::new(work_dir, "inbound_sync")),
            outbound: Mutex::new(Outbound {
                writer: None,
                backlog: VecDeque::new(),
            }),
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(listener, shared.clone(), cancel.clone()));
        tokio::spawn(gc_loop(shared.clone(), cancel.clone()));

        info!(port, "socket bridge listening");
        Ok(Self {
            shared,
            port,
            cancel,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &HostMessage) -> Result<(), BridgeError> {
        if self.cancel.is_cancelled() {
            return Err(BridgeError::Closed);
        }
        let line = encode_line(message)?;
        send_line(&self.shared, line).await;
        Ok(())
    }
}

async fn send_line(shared: &Shared, line: String) {
    let mut out = shared.outbound.lock().await;
    if let Some((generation, writer)) = out.writer.as_mut() {
        match writer.write_all(line.as_bytes()).await {
            Ok(()) => return,
            Err(e) => {
                warn!(generation = *generation, error = %e, "guest connection write failed");
                out.writer = None;
                shared.connected.store(false, Ordering::SeqCst);
            }
        }
    }
    out.backlog.push_back(line);
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);
        let generation = shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        info!(%peer, generation, "guest channel connected");

        let (reader, mut writer) = stream.into_split();
        {
            let mut out = shared.outbound.lock().await;
            while let Some(line) = out.backlog.pop_front() {
                if let Err(e) = writer.write_all(line.as_bytes()).await {
                    warn!(error = %e, "failed to flush backlog");
                    out.backlog.push_front(line);
                    break;
                }
            }
            out.writer = Some((generation, writer));
            shared.connected.store(true, Ordering::SeqCst);
        }

        tokio::spawn(read_loop(reader, shared.clone(), generation, cancel.clone()));
    }
    debug!("accept loop stopped");
}

async fn read_loop(
    reader: OwnedReadHalf,
    shared: Arc<Shared>,
    generation: u64,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => handle_guest_line(&shared, &line).await,
            Ok(None) => break,
            Err(e) => {
                warn!(generation, error = %e, "guest channel read failed");
                break;
            }
        }
    }

    let mut out = shared.outbound.lock().await;
    if matches!(out.writer, Some((g, _)) if g == generation) {
        out.writer = None;
        shared.connected.store(false, Ordering::SeqCst);
    }
    info!(generation, "guest channel disconnected");
}

/// Apply one guest line; failures are logged and never end the loop
async fn handle_guest_line(shared: &Shared, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let message: GuestMessage = match decode_line(line) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "undecodable guest line");
            return;
        }
    };

    match message {
        GuestMessage::Heartbeat(heartbeat) => {
            if let Err(e) = shared.layout.write_heartbeat(&heartbeat).await {
                warn!(error = %e, "failed to mirror heartbeat");
            }
        }
        GuestMessage::Stream(envelope) => {
            if let Err(e) = shared
                .layout
                .append_stream_event(&envelope.request_id, &envelope.event)
                .await
            {
                warn!(request_id = %envelope.request_id, error = %e, "failed to mirror stream event");
            }
        }
        GuestMessage::FileSync(payload) => {
            let ready = lock_assembler(shared).accept_whole(&payload);
            match ready {
                Ok(ready) => match ready.write().await {
                    Ok(path) => debug!(path = %path.display(), "synced file from guest"),
                    Err(e) => warn!(path = %payload.path, error = %e, "failed to write guest file"),
                },
                Err(e) => warn!(path = %payload.path, error = %e, "dropped guest file"),
            }
        }
        GuestMessage::FileSyncChunk(chunk) => {
            let result = lock_assembler(shared).accept_chunk(&chunk);
            if let Err(e) = result {
                warn!(transfer_id = %chunk.transfer_id, error = %e, "dropped guest chunk");
            }
        }
        GuestMessage::FileSyncComplete(complete) => {
            let ready = lock_assembler(shared).accept_complete(&complete);
            match ready {
                Ok(ready) => match ready.write().await {
                    Ok(path) => debug!(path = %path.display(), "synced chunked file from guest"),
                    Err(e) => warn!(transfer_id = %complete.transfer_id, error = %e, "failed to write guest transfer"),
                },
                Err(e) => warn!(transfer_id = %complete.transfer_id, error = %e, "abandoned guest transfer"),
            }
        }
    }
}

fn lock_assembler(shared: &Shared) -> std::sync::MutexGuard<'_, TransferAssembler> {
    // A panic mid-write leaves only a stale in-flight map behind.
    shared
        .assembler
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn gc_loop(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(GC_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let dropped = lock_assembler(&shared).collect_garbage();
                if dropped > 0 {
                    debug!(dropped, "expired idle inbound transfers");
                }
            }
        }
    }
}

#[async_trait]
impl HostBridge for SocketBridge {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn layout(&self) -> &IpcLayout {
        &self.shared.layout
    }

    async fn submit_request(&self, request: &AgentRequest) -> Result<(), BridgeError> {
        self.send(&HostMessage::Request(request.clone())).await?;
        debug!(request_id = %request.id, connected = self.is_connected(), "request submitted");
        Ok(())
    }

    async fn send_permission_response(
        &self,
        permission_id: &str,
        response: &PermissionResponse,
    ) -> Result<(), BridgeError> {
        self.send(&HostMessage::PermissionResponse(PermissionReply {
            request_id: permission_id.to_string(),
            response: response.clone(),
        }))
        .await
    }

    async fn send_host_tool_response(
        &self,
        tool_request_id: &str,
        response: &HostToolResponse,
    ) -> Result<(), BridgeError> {
        self.send(&HostMessage::HostToolResponse(HostToolReply {
            request_id: tool_request_id.to_string(),
            response: response.clone(),
        }))
        .await
    }

    async fn push_file(&self, relative_path: &str, data: &[u8]) -> Result<(), BridgeError> {
        match split_file(relative_path, data) {
            OutboundFile::Single(payload) => self.send(&HostMessage::PushFile(payload)).await,
            OutboundFile::Chunked { chunks, complete } => {
                for chunk in chunks {
                    self.send(&HostMessage::PushFileChunk(chunk)).await?;
                }
                self.send(&HostMessage::PushFileComplete(complete)).await
            }
        }
    }

    async fn close(&self) {
        self.cancel.cancel();
        let mut out = self.shared.outbound.lock().await;
        if let Some((_, mut writer)) = out.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.shared.connected.store(false, Ordering::SeqCst);
    }
}

impl Drop for SocketBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
