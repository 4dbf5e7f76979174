//! Unix Domain Socket Transport
//!
//! Local IPC transport using Unix domain stream sockets. Frames are written
//! with a 4-byte big-endian length prefix. The end that owns an address
//! binds a listener at the socket path; the peer connects lazily on its first
//! send or receive, so either end may open first. Until a peer is attached,
//! sends report "try again".

use super::{TransportAdapter, TransportFactory, TransportKind};
use crate::config::{Direction, Role};
use crate::header::WireFormat;
use crate::{CommError, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use comm_config::comm;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unix socket transport attached to one socket path
#[derive(Debug)]
pub struct UnixTransport {
    path: PathBuf,
    address: String,
    direction: Direction,
    role: Role,
    max_frame_size: usize,
    open: AtomicBool,
    connected: AtomicBool,
    connect_lock: Mutex<()>,
    inbound_tx: mpsc::UnboundedSender<Bytes>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    inbound_pending: Arc<AtomicUsize>,
    writers: Arc<Mutex<Vec<OwnedWriteHalf>>>,
    tasks: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
    bytes_sent: AtomicU64,
}

impl UnixTransport {
    pub fn new(
        path: impl Into<PathBuf>,
        direction: Direction,
        role: Role,
        max_frame_size: usize,
    ) -> Self {
        let path = path.into();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            address: path.display().to_string(),
            path,
            direction,
            role,
            max_frame_size,
            open: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connect_lock: Mutex::new(()),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            inbound_pending: Arc::new(AtomicUsize::new(0)),
            writers: Arc::new(Mutex::new(Vec::new())),
            tasks: Arc::new(parking_lot::Mutex::new(Vec::new())),
            bytes_sent: AtomicU64::new(0),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total bytes written, including length prefixes
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    fn frame_limit(&self) -> usize {
        self.max_frame_size + WireFormat::MAX_OVERHEAD
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CommError::connection(
                "Unix socket transport not open",
                Some(&self.address),
            ))
        }
    }

    /// Bind to the socket path and start accepting peers
    async fn bind(&self) -> Result<()> {
        // Remove stale socket file if it exists
        if self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| {
                CommError::transport_with_source("Failed to remove existing socket", e)
            })?;
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CommError::transport_with_source("Failed to create socket directory", e)
            })?;
        }

        let listener = UnixListener::bind(&self.path)
            .map_err(|e| CommError::transport_with_source("Failed to bind Unix socket", e))?;
        info!(address = %self.address, direction = %self.direction, "Unix socket listening");

        let writers = Arc::clone(&self.writers);
        let tasks = Arc::clone(&self.tasks);
        let inbound_tx = self.inbound_tx.clone();
        let pending = Arc::clone(&self.inbound_pending);
        let limit = self.frame_limit();
        let address = self.address.clone();

        let accept_loop = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        debug!(%address, "Accepted Unix socket peer");
                        let (read, write) = stream.into_split();
                        writers.lock().await.push(write);
                        let reader = tokio::spawn(read_frames(
                            read,
                            inbound_tx.clone(),
                            Arc::clone(&pending),
                            limit,
                        ));
                        tasks.lock().push(reader);
                    }
                    Err(e) => {
                        warn!(%address, error = %e, "Unix socket accept failed");
                        break;
                    }
                }
            }
        });
        self.tasks.lock().push(accept_loop);
        Ok(())
    }

    /// Connect to the peer's listener if not yet connected
    async fn ensure_connected(&self) -> Result<()> {
        if self.role == Role::Bind || self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let _guard = self.connect_lock.lock().await;
        if self.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            CommError::resource_exhausted(
                "unix_socket",
                format!("peer at {} not listening: {}", self.address, e),
            )
        })?;
        debug!(address = %self.address, direction = %self.direction, "Connected to Unix socket");

        let (read, write) = stream.into_split();
        self.writers.lock().await.push(write);
        let reader = tokio::spawn(read_frames(
            read,
            self.inbound_tx.clone(),
            Arc::clone(&self.inbound_pending),
            self.frame_limit(),
        ));
        self.tasks.lock().push(reader);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }
}

/// Read length-prefixed frames until the peer goes away
async fn read_frames(
    mut stream: OwnedReadHalf,
    inbound: mpsc::UnboundedSender<Bytes>,
    pending: Arc<AtomicUsize>,
    limit: usize,
) {
    let mut buffer = BytesMut::new();
    loop {
        let mut len_bytes = [0u8; 4];
        if stream.read_exact(&mut len_bytes).await.is_err() {
            break;
        }
        let message_len = u32::from_be_bytes(len_bytes) as usize;
        if message_len > limit {
            warn!(message_len, limit, "Dropping Unix socket peer: frame exceeds maximum");
            break;
        }

        buffer.resize(message_len, 0);
        if stream.read_exact(&mut buffer[..]).await.is_err() {
            break;
        }

        pending.fetch_add(1, Ordering::AcqRel);
        if inbound.send(buffer.split_to(message_len).freeze()).is_err() {
            break;
        }
    }
    debug!("Unix socket peer disconnected");
}

#[async_trait]
impl TransportAdapter for UnixTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Unix
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.role == Role::Bind {
            self.bind().await?;
        }
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let mut writers = self.writers.lock().await;
        for mut writer in writers.drain(..) {
            let _ = writer.shutdown().await;
        }
        drop(writers);

        if self.role == Role::Bind && self.path.exists() {
            std::fs::remove_file(&self.path).map_err(|e| {
                CommError::transport_with_source("Failed to remove socket file", e)
            })?;
        }

        debug!(address = %self.address, direction = %self.direction, "Unix socket transport closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_direct(&self, frame: &[u8]) -> Result<()> {
        self.ensure_open()?;
        if frame.len() > self.frame_limit() {
            return Err(CommError::protocol(format!(
                "Frame size {} exceeds maximum {}",
                frame.len(),
                self.frame_limit()
            )));
        }
        self.ensure_connected().await?;

        let mut writers = self.writers.lock().await;
        let writer = writers.first_mut().ok_or_else(|| {
            CommError::resource_exhausted(
                "unix_socket",
                format!("no peer attached to {}", self.address),
            )
        })?;

        let mut buffer = Vec::with_capacity(4 + frame.len());
        buffer.extend_from_slice(&(frame.len() as u32).to_be_bytes());
        buffer.extend_from_slice(frame);

        let written = match writer.write_all(&buffer).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            writers.remove(0);
            self.connected.store(false, Ordering::Release);
            return Err(CommError::transport_with_source("Failed to write frame", e));
        }

        self.bytes_sent
            .fetch_add(buffer.len() as u64, Ordering::Release);
        Ok(())
    }

    async fn recv_direct(&self) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        if let Err(e) = self.ensure_connected().await {
            if e.is_transient() {
                return Ok(None);
            }
            return Err(e);
        }

        let mut inbound = self.inbound_rx.lock().await;
        match inbound.try_recv() {
            Ok(frame) => {
                self.inbound_pending.fetch_sub(1, Ordering::AcqRel);
                Ok(Some(frame))
            }
            Err(_) => Ok(None),
        }
    }

    fn pending_count(&self) -> usize {
        self.inbound_pending.load(Ordering::Acquire)
    }

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

/// Factory for Unix socket transports rooted at one socket directory
#[derive(Debug, Clone)]
pub struct UnixFactory {
    socket_dir: PathBuf,
    max_frame_size: usize,
}

impl UnixFactory {
    pub fn new(socket_dir: impl Into<PathBuf>, max_frame_size: usize) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            max_frame_size,
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }
}

impl Default for UnixFactory {
    fn default() -> Self {
        Self::new(comm::DEFAULT_SOCKET_DIR, comm::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl TransportFactory for UnixFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Unix
    }

    fn generate_address(&self) -> String {
        self.socket_dir
            .join(format!("comm-{}.sock", Uuid::new_v4().simple()))
            .display()
            .to_string()
    }

    fn create(
        &self,
        address: &str,
        direction: Direction,
        role: Role,
    ) -> Result<Arc<dyn TransportAdapter>> {
        if address.is_empty() {
            return Err(CommError::configuration(
                "Unix socket address cannot be empty",
                Some("address"),
            ));
        }
        Ok(Arc::new(UnixTransport::new(
            address,
            direction,
            role,
            self.max_frame_size,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    async fn recv_within(transport: &UnixTransport, timeout: Duration) -> Option<Bytes> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(frame) = transport.recv_direct().await.unwrap() {
                return Some(frame);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        None
    }

    #[tokio::test]
    async fn test_unix_socket_exchange() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.sock");

        let server = UnixTransport::new(&path, Direction::Recv, Role::Bind, 1024);
        server.open().await.unwrap();
        assert!(path.exists());

        let client = UnixTransport::new(&path, Direction::Send, Role::Connect, 1024);
        client.open().await.unwrap();
        client.send_direct(b"Hello, server!").await.unwrap();

        let frame = recv_within(&server, Duration::from_secs(2)).await.unwrap();
        assert_eq!(&frame[..], b"Hello, server!");
        assert_eq!(server.pending_count(), 0);

        client.close().await.unwrap();
        server.close().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bound_sender_waits_for_peer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("work.sock");

        let sender = UnixTransport::new(&path, Direction::Send, Role::Bind, 1024);
        sender.open().await.unwrap();
        let err = sender.send_direct(b"too early").await.unwrap_err();
        assert!(err.is_transient());

        let receiver = UnixTransport::new(&path, Direction::Recv, Role::Connect, 1024);
        receiver.open().await.unwrap();
        assert!(receiver.recv_direct().await.unwrap().is_none());

        // Give the accept loop a moment to register the peer
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            match sender.send_direct(b"now").await {
                Ok(()) => break,
                Err(e) if e.is_transient() && tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(e) => panic!("send failed: {}", e),
            }
        }

        let frame = recv_within(&receiver, Duration::from_secs(2)).await.unwrap();
        assert_eq!(&frame[..], b"now");

        receiver.close().await.unwrap();
        sender.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_listener_is_transient() {
        let dir = tempdir().unwrap();
        let client = UnixTransport::new(
            dir.path().join("missing.sock"),
            Direction::Send,
            Role::Connect,
            1024,
        );
        client.open().await.unwrap();
        let err = client.send_direct(b"x").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[test]
    fn test_generated_address_in_socket_dir() {
        let factory = UnixFactory::new("/tmp/comm-test", 1024);
        let address = factory.generate_address();
        assert!(address.starts_with("/tmp/comm-test/comm-"));
        assert!(address.ends_with(".sock"));
    }
}
