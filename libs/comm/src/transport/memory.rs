//! In-Process Queue Transport
//!
//! Bounded FIFO queues shared through a `MemoryHub`, keyed by address.
//! A full queue reports "try again" so the backlog engine has a capacity
//! limit to work against. Queues outlive a closing sender while frames are
//! still waiting, and are dropped once the last endpoint detaches from an
//! empty queue.

use super::{TransportAdapter, TransportFactory, TransportKind};
use crate::config::{Direction, Role};
use crate::header::WireFormat;
use crate::{CommError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use comm_config::comm;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};
use uuid::Uuid;

/// One addressed queue
#[derive(Debug)]
struct MemoryQueue {
    frames: VecDeque<Bytes>,
    endpoints: usize,
}

/// Process-wide set of in-process queues
#[derive(Debug)]
pub struct MemoryHub {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    capacity: usize,
    max_frame_size: usize,
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(comm::DEFAULT_QUEUE_CAPACITY, comm::DEFAULT_MAX_FRAME_SIZE)
    }
}

impl MemoryHub {
    pub fn new(capacity: usize, max_frame_size: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            max_frame_size,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn attach(&self, address: &str) {
        let mut queues = self.queues.lock();
        let queue = queues
            .entry(address.to_string())
            .or_insert_with(|| MemoryQueue {
                frames: VecDeque::new(),
                endpoints: 0,
            });
        queue.endpoints += 1;
    }

    fn detach(&self, address: &str) {
        let mut queues = self.queues.lock();
        let remove = match queues.get_mut(address) {
            Some(queue) => {
                queue.endpoints = queue.endpoints.saturating_sub(1);
                queue.endpoints == 0 && queue.frames.is_empty()
            }
            None => false,
        };
        if remove {
            queues.remove(address);
            trace!(address, "Dropped idle memory queue");
        }
    }

    fn push(&self, address: &str, frame: Bytes) -> Result<()> {
        let mut queues = self.queues.lock();
        let queue = queues
            .get_mut(address)
            .ok_or_else(|| CommError::connection("Memory queue not attached", Some(address)))?;
        if queue.frames.len() >= self.capacity {
            return Err(CommError::resource_exhausted(
                "memory_queue",
                format!("queue {} holds {} frames", address, self.capacity),
            ));
        }
        queue.frames.push_back(frame);
        Ok(())
    }

    fn pop(&self, address: &str) -> Option<Bytes> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(address)?;
        let frame = queue.frames.pop_front();
        if queue.endpoints == 0 && queue.frames.is_empty() {
            queues.remove(address);
        }
        frame
    }

    fn len(&self, address: &str) -> usize {
        self.queues
            .lock()
            .get(address)
            .map_or(0, |queue| queue.frames.len())
    }

    /// Number of live queues
    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Frames waiting at `address`
    pub fn pending(&self, address: &str) -> usize {
        self.len(address)
    }

    /// Drop every queue
    pub fn clear(&self) {
        let mut queues = self.queues.lock();
        debug!(count = queues.len(), "Clearing memory hub");
        queues.clear();
    }
}

/// Adapter attached to one hub queue
#[derive(Debug)]
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    address: String,
    direction: Direction,
    open: AtomicBool,
}

impl MemoryTransport {
    pub fn new(hub: Arc<MemoryHub>, address: impl Into<String>, direction: Direction) -> Self {
        Self {
            hub,
            address: address.into(),
            direction,
            open: AtomicBool::new(false),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CommError::connection(
                "Memory transport not open",
                Some(&self.address),
            ))
        }
    }
}

#[async_trait]
impl TransportAdapter for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn open(&self) -> Result<()> {
        if !self.open.swap(true, Ordering::AcqRel) {
            self.hub.attach(&self.address);
            debug!(address = %self.address, direction = %self.direction, "Memory transport opened");
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.hub.detach(&self.address);
            debug!(address = %self.address, direction = %self.direction, "Memory transport closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_direct(&self, frame: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let limit = self.hub.max_frame_size + WireFormat::MAX_OVERHEAD;
        if frame.len() > limit {
            return Err(CommError::protocol(format!(
                "Frame size {} exceeds maximum {}",
                frame.len(),
                limit
            )));
        }
        self.hub.push(&self.address, Bytes::copy_from_slice(frame))
    }

    async fn recv_direct(&self) -> Result<Option<Bytes>> {
        self.ensure_open()?;
        Ok(self.hub.pop(&self.address))
    }

    fn pending_count(&self) -> usize {
        self.hub.len(&self.address)
    }

    fn max_frame_size(&self) -> usize {
        self.hub.max_frame_size
    }
}

/// Factory for in-process queue transports
#[derive(Debug, Clone)]
pub struct MemoryFactory {
    hub: Arc<MemoryHub>,
}

impl MemoryFactory {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

impl TransportFactory for MemoryFactory {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn generate_address(&self) -> String {
        format!("mem-{}", Uuid::new_v4().simple())
    }

    fn create(
        &self,
        address: &str,
        direction: Direction,
        _role: Role,
    ) -> Result<Arc<dyn TransportAdapter>> {
        Ok(Arc::new(MemoryTransport::new(
            Arc::clone(&self.hub),
            address,
            direction,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(hub: &Arc<MemoryHub>, address: &str) -> (MemoryTransport, MemoryTransport) {
        (
            MemoryTransport::new(Arc::clone(hub), address, Direction::Send),
            MemoryTransport::new(Arc::clone(hub), address, Direction::Recv),
        )
    }

    #[tokio::test]
    async fn test_fifo_exchange() {
        let hub = Arc::new(MemoryHub::default());
        let (tx, rx) = pair(&hub, "mem-fifo");
        tx.open().await.unwrap();
        rx.open().await.unwrap();

        tx.send_direct(b"one").await.unwrap();
        tx.send_direct(b"two").await.unwrap();
        assert_eq!(tx.pending_count(), 2);

        assert_eq!(&rx.recv_direct().await.unwrap().unwrap()[..], b"one");
        assert_eq!(&rx.recv_direct().await.unwrap().unwrap()[..], b"two");
        assert!(rx.recv_direct().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_full_queue_reports_try_again() {
        let hub = Arc::new(MemoryHub::new(2, 64));
        let (tx, _rx) = pair(&hub, "mem-full");
        tx.open().await.unwrap();

        tx.send_direct(b"a").await.unwrap();
        tx.send_direct(b"b").await.unwrap();
        let err = tx.send_direct(b"c").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let hub = Arc::new(MemoryHub::new(4, 8));
        let (tx, _rx) = pair(&hub, "mem-big");
        tx.open().await.unwrap();

        let frame = vec![0u8; 8 + WireFormat::MAX_OVERHEAD + 1];
        let err = tx.send_direct(&frame).await.unwrap_err();
        assert!(matches!(err, CommError::Protocol { .. }));
    }

    #[tokio::test]
    async fn test_queue_outlives_sender_until_drained() {
        let hub = Arc::new(MemoryHub::default());
        let (tx, rx) = pair(&hub, "mem-linger");
        tx.open().await.unwrap();
        tx.send_direct(b"late").await.unwrap();
        tx.close().await.unwrap();
        assert_eq!(hub.queue_count(), 1);

        rx.open().await.unwrap();
        assert_eq!(&rx.recv_direct().await.unwrap().unwrap()[..], b"late");
        rx.close().await.unwrap();
        assert_eq!(hub.queue_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_transport_refuses_io() {
        let hub = Arc::new(MemoryHub::default());
        let (tx, _rx) = pair(&hub, "mem-closed");
        assert!(tx.send_direct(b"x").await.is_err());
        tx.open().await.unwrap();
        tx.close().await.unwrap();
        tx.close().await.unwrap();
        assert!(!tx.is_open());
    }

    #[test]
    fn test_generated_addresses_are_unique() {
        let factory = MemoryFactory::new(Arc::new(MemoryHub::default()));
        assert_ne!(factory.generate_address(), factory.generate_address());
    }
}
