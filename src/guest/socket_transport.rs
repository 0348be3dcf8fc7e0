//! Line-JSON transport over the virtio-serial port
//!
//! ```text
//!   device ──► reader task ──┬─ request             → requests mpsc
//!                            ├─ permission_response → permissions registry
//!                            ├─ host_tool_response  → host-tool registry
//!                            └─ push_file*          → work dir (guarded)
//!
//!   emit / heartbeat / file_sync ──► writer mpsc ──► writer task ──► device
//! ```
//!
//! The port reads EOF while the host side is disconnected; the reader keeps
//! retrying instead of treating that as the end of the channel.
//!
//! The device is opened twice. A `tokio::fs::File` runs one blocking call at
//! a time, so a single handle would park every write behind the idle read.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sync::SyncScanner;
use super::transport::{GuestTransport, TransportError};
use crate::metrics::FILE_TRANSFERS;
use crate::protocol::{
    decode_line, encode_line, split_file, AgentRequest, GuestMessage, Heartbeat, HostMessage,
    HostToolRequest, HostToolResponse, OutboundFile, PendingOutcome, PendingRegistry,
    PermissionRequest, PermissionResponse, ReadyFile, StreamEnvelope, StreamEvent,
    TransferAssembler, TransportMode,
};

const WRITE_QUEUE: usize = 256;
const WRITE_RETRIES: u32 = 10;
const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const GC_INTERVAL: Duration = Duration::from_secs(5);

/// State shared with the reader task
struct Inbound {
    permissions: PendingRegistry<PermissionResponse>,
    host_tools: PendingRegistry<HostToolResponse>,
    requests: mpsc::UnboundedSender<AgentRequest>,
    assembler: StdMutex<TransferAssembler>,
    scanner: Arc<StdMutex<SyncScanner>>,
}

pub struct SocketTransport {
    writer: mpsc::Sender<String>,
    requests: Mutex<mpsc::UnboundedReceiver<AgentRequest>>,
    permissions: PendingRegistry<PermissionResponse>,
    host_tools: PendingRegistry<HostToolResponse>,
    scanner: Arc<StdMutex<SyncScanner>>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl SocketTransport {
    /// Open the serial device with separate read and write handles
    pub async fn open(device: &Path, work_dir: PathBuf, timeout: Duration) -> Result<Self, TransportError> {
        // Opened together: on a FIFO each open blocks until the other side exists
        let mut read_opts = tokio::fs::OpenOptions::new();
        read_opts.read(true);
        let mut write_opts = tokio::fs::OpenOptions::new();
        write_opts.write(true);
        let (reader, writer) = tokio::try_join!(
            read_opts.open(device),
            write_opts.open(device),
        )?;
        info!(device = %device.display(), "serial channel opened");
        Ok(Self::from_parts(reader, writer, work_dir, timeout))
    }

    /// Run the protocol over any duplex byte stream
    pub fn from_stream<S>(stream: S, work_dir: PathBuf, timeout: Duration) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        Self::from_parts(read_half, write_half, work_dir, timeout)
    }

    /// Run the protocol over independent read and write ends
    pub fn from_parts<R, W>(read_half: R, write_half: W, work_dir: PathBuf, timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::channel(WRITE_QUEUE);
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let scanner = Arc::new(StdMutex::new(SyncScanner::new(&work_dir)));

        let inbound = Arc::new(Inbound {
            permissions: PendingRegistry::new(),
            host_tools: PendingRegistry::new(),
            requests: requests_tx,
            assembler: StdMutex::new(TransferAssembler::new(&work_dir, "push")),
            scanner: scanner.clone(),
        });
        let permissions = inbound.permissions.clone();
        let host_tools = inbound.host_tools.clone();

        tokio::spawn(read_loop(read_half, inbound, cancel.clone()));
        tokio::spawn(write_loop(write_half, writer_rx, cancel.clone()));

        Self {
            writer: writer_tx,
            requests: Mutex::new(requests_rx),
            permissions,
            host_tools,
            scanner,
            timeout,
            cancel,
        }
    }

    async fn send(&self, message: &GuestMessage) -> Result<(), TransportError> {
        let line = encode_line(message)?;
        self.writer
            .send(line)
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn send_file(&self, relative: &str, data: &[u8]) -> Result<(), TransportError> {
        match split_file(relative, data) {
            OutboundFile::Single(payload) => self.send(&GuestMessage::FileSync(payload)).await,
            OutboundFile::Chunked { chunks, complete } => {
                for chunk in chunks {
                    self.send(&GuestMessage::FileSyncChunk(chunk)).await?;
                }
                self.send(&GuestMessage::FileSyncComplete(complete)).await
            }
        }
    }

    fn scanner(&self) -> std::sync::MutexGuard<'_, SyncScanner> {
        lock(&self.scanner)
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn read_loop<R: AsyncRead + Unpin + Send>(reader: R, inbound: Arc<Inbound>, cancel: CancellationToken) {
    let mut lines = BufReader::new(reader).lines();
    let mut gc = tokio::time::interval(GC_INTERVAL);
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = gc.tick() => {
                let dropped = lock(&inbound.assembler).collect_garbage();
                if dropped > 0 {
                    debug!(dropped, "expired idle pushes");
                }
                continue;
            }
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => handle_host_line(&inbound, &line).await,
            Ok(None) => {
                // Host side not connected; the port reads EOF until it is
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "serial read failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(RECONNECT_BACKOFF) => {}
                }
            }
        }
    }
    inbound.permissions.clear();
    inbound.host_tools.clear();
    debug!("serial reader stopped");
}

/// Dispatch one host line; bad lines are logged and skipped
async fn handle_host_line(inbound: &Inbound, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let message: HostMessage = match decode_line(line) {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "undecodable host line");
            return;
        }
    };

    match message {
        HostMessage::Request(request) => {
            debug!(request_id = %request.id, "request received");
            if inbound.requests.send(request).is_err() {
                warn!("request dropped; daemon is not reading");
            }
        }
        HostMessage::PermissionResponse(reply) => {
            if !inbound.permissions.resolve(&reply.request_id, reply.response) {
                warn!(permission_id = %reply.request_id, "late or unknown permission response");
            }
        }
        HostMessage::HostToolResponse(reply) => {
            if !inbound.host_tools.resolve(&reply.request_id, reply.response) {
                warn!(tool_request_id = %reply.request_id, "late or unknown host tool response");
            }
        }
        HostMessage::PushFile(payload) => {
            let ready = lock(&inbound.assembler).accept_whole(&payload);
            match ready {
                Ok(ready) => store_push(inbound, ready, &payload.path).await,
                Err(e) => warn!(path = %payload.path, error = %e, "dropped pushed file"),
            }
        }
        HostMessage::PushFileChunk(chunk) => {
            let result = lock(&inbound.assembler).accept_chunk(&chunk);
            if let Err(e) = result {
                warn!(transfer_id = %chunk.transfer_id, error = %e, "dropped pushed chunk");
            }
        }
        HostMessage::PushFileComplete(complete) => {
            let ready = lock(&inbound.assembler).accept_complete(&complete);
            match ready {
                Ok(ready) => store_push(inbound, ready, &complete.path).await,
                Err(e) => warn!(transfer_id = %complete.transfer_id, error = %e, "abandoned push"),
            }
        }
    }
}

async fn store_push(inbound: &Inbound, ready: ReadyFile, relative: &str) {
    match ready.write().await {
        Ok(path) => lock(&inbound.scanner).observe(&path),
        Err(e) => warn!(path = %relative, error = %e, "failed to write pushed file"),
    }
}

async fn write_loop<W: AsyncWrite + Unpin + Send>(
    mut writer: W,
    mut rx: mpsc::Receiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let mut attempt = 0;
        loop {
            let result = async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await;
            match result {
                Ok(()) => break,
                Err(e) if attempt < WRITE_RETRIES => {
                    attempt += 1;
                    debug!(attempt, error = %e, "serial write failed; retrying");
                    tokio::time::sleep(RECONNECT_BACKOFF).await;
                }
                Err(e) => {
                    warn!(error = %e, "dropping line after repeated write failures");
                    break;
                }
            }
        }
    }
    debug!("serial writer stopped");
}

#[async_trait]
impl GuestTransport for SocketTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Socket
    }

    async fn next_request(&self) -> Option<AgentRequest> {
        self.requests.lock().await.recv().await
    }

    async fn emit(&self, request_id: &str, event: &StreamEvent) -> Result<(), TransportError> {
        self.send(&GuestMessage::Stream(StreamEnvelope {
            request_id: request_id.to_string(),
            event: event.clone(),
        }))
        .await
    }

    async fn await_permission(
        &self,
        request_id: &str,
        permission: PermissionRequest,
        cancel: &CancellationToken,
    ) -> PendingOutcome<PermissionResponse> {
        let id = permission.request_id.clone();
        let rx = self.permissions.insert(id.clone());
        if let Err(e) = self
            .emit(request_id, &StreamEvent::PermissionRequest(permission))
            .await
        {
            warn!(request_id, error = %e, "failed to emit permission request");
            self.permissions.expire(&id);
            return PendingOutcome::Cancelled;
        }
        self.permissions.wait(&id, rx, self.timeout, cancel).await
    }

    async fn await_host_tool(
        &self,
        request_id: &str,
        call: HostToolRequest,
        cancel: &CancellationToken,
    ) -> PendingOutcome<HostToolResponse> {
        let id = call.request_id.clone();
        let rx = self.host_tools.insert(id.clone());
        if let Err(e) = self
            .emit(request_id, &StreamEvent::HostToolRequest(call))
            .await
        {
            warn!(request_id, error = %e, "failed to emit host tool request");
            self.host_tools.expire(&id);
            return PendingOutcome::Cancelled;
        }
        self.host_tools.wait(&id, rx, self.timeout, cancel).await
    }

    async fn write_heartbeat(&self, heartbeat: &Heartbeat) -> Result<(), TransportError> {
        self.send(&GuestMessage::Heartbeat(heartbeat.clone())).await
    }

    async fn acknowledge(&self, _request_id: &str) {}

    async fn sync_files(&self, force: bool) -> usize {
        let candidates = self.scanner().scan(force);
        let mut sent = 0;
        for candidate in candidates {
            let data = match tokio::fs::read(&candidate.path).await {
                Ok(data) => data,
                Err(e) => {
                    debug!(path = %candidate.relative, error = %e, "file vanished before sync");
                    self.scanner().forget(&candidate.relative);
                    continue;
                }
            };
            match self.send_file(&candidate.relative, &data).await {
                Ok(()) => {
                    sent += 1;
                    FILE_TRANSFERS
                        .with_label_values(&["outbound_sync", "written"])
                        .inc();
                }
                Err(e) => {
                    warn!(path = %candidate.relative, error = %e, "file sync failed");
                    self.scanner().forget(&candidate.relative);
                }
            }
        }
        if sent > 0 {
            debug!(sent, force, "synced files to host");
        }
        sent
    }

    fn ipc_mounted(&self) -> bool {
        false
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PermissionReply, SINGLE_MESSAGE_THRESHOLD};
    use serde_json::json;

    async fn read_message(lines: &mut tokio::io::Lines<BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>>) -> GuestMessage {
        let line = lines.next_line().await.unwrap().unwrap();
        decode_line(&line).unwrap()
    }

    #[tokio::test]
    async fn test_permission_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (guest_end, host_end) = tokio::io::duplex(64 * 1024);
        let transport = Arc::new(SocketTransport::from_stream(
            guest_end,
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        ));
        let (host_read, mut host_write) = tokio::io::split(host_end);
        let mut host_lines = BufReader::new(host_read).lines();

        let waiter = {
            let transport = transport.clone();
            tokio::spawn(async move {
                transport
                    .await_permission(
                        "r1",
                        PermissionRequest {
                            request_id: "p1".into(),
                            tool_name: "Bash".into(),
                            tool_input: json!({"command": "rm x"}),
                            confirmation_mode: Default::default(),
                        },
                        &CancellationToken::new(),
                    )
                    .await
            })
        };

        match read_message(&mut host_lines).await {
            GuestMessage::Stream(envelope) => {
                assert_eq!(envelope.request_id, "r1");
                assert!(matches!(envelope.event, StreamEvent::PermissionRequest(_)));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let reply = HostMessage::PermissionResponse(PermissionReply {
            request_id: "p1".into(),
            response: PermissionResponse::deny("no"),
        });
        host_write
            .write_all(encode_line(&reply).unwrap().as_bytes())
            .await
            .unwrap();

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, PendingOutcome::Resolved(ref r) if !r.is_allow()));
    }

    #[tokio::test]
    async fn test_requests_and_pushes_dispatched() {
        let dir = tempfile::tempdir().unwrap();
        let (guest_end, host_end) = tokio::io::duplex(4 * 1024 * 1024);
        let transport = SocketTransport::from_stream(
            guest_end,
            dir.path().to_path_buf(),
            Duration::from_secs(5),
        );
        let (_host_read, mut host_write) = tokio::io::split(host_end);

        let big: Vec<u8> = (0..SINGLE_MESSAGE_THRESHOLD * 2 + 17).map(|i| (i % 241) as u8).collect();
        let mut lines = String::new();
        match split_file("data/big.bin", &big) {
            OutboundFile::Chunked { mut chunks, complete } => {
                chunks.reverse();
                for chunk in chunks {
                    lines.push_str(&encode_line(&HostMessage::PushFileChunk(chunk)).unwrap());
                }
                lines.push_str(&encode_line(&HostMessage::PushFileComplete(complete)).unwrap());
            }
            OutboundFile::Single(_) => panic!("expected chunked transfer"),
        }
        lines.push_str(
            r#"{"type":"request","id":"r9","cwd":"/workspace","prompt":"go","workspaceRoot":"/workspace","hostWorkspaceRoot":"/h"}"#,
        );
        lines.push('\n');
        host_write.write_all(lines.as_bytes()).await.unwrap();

        let request = transport.next_request().await.unwrap();
        assert_eq!(request.id, "r9");
        // Request came after the complete marker on the same stream
        assert_eq!(std::fs::read(dir.path().join("data/big.bin")).unwrap(), big);
        // Pushed files are not synced straight back
        assert_eq!(transport.sync_files(false).await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_device_writes_flow_while_reader_idle() {
        use crate::protocol::DaemonStatus;

        let dir = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let port = dir.path().join("org.sandvisor.ipc");
        nix::unistd::mkfifo(&port, nix::sys::stat::Mode::S_IRWXU).unwrap();

        let transport = SocketTransport::open(&port, work.path().to_path_buf(), Duration::from_secs(5))
            .await
            .unwrap();

        // More lines than the write queue holds: only a live writer drains them
        let heartbeat = Heartbeat {
            timestamp: 1,
            pid: 7,
            uptime: 0,
            ipc_mounted: false,
            transport: TransportMode::Socket,
            status: DaemonStatus::Ready,
        };
        tokio::time::timeout(Duration::from_secs(3), async {
            for _ in 0..(WRITE_QUEUE * 2) {
                transport.write_heartbeat(&heartbeat).await.unwrap();
            }
        })
        .await
        .expect("writes stalled behind the pending read");

        // The read side still delivers host lines
        let mut host = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&port)
            .await
            .unwrap();
        host.write_all(
            b"{\"type\":\"request\",\"id\":\"r1\",\"cwd\":\"/workspace\",\"prompt\":\"go\",\"workspaceRoot\":\"/workspace\",\"hostWorkspaceRoot\":\"/h\"}\n",
        )
        .await
        .unwrap();
        host.flush().await.unwrap();

        let request = tokio::time::timeout(Duration::from_secs(3), transport.next_request())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(request.id, "r1");
    }
}
