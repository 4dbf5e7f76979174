//! Work Channels
//!
//! A message larger than a channel's frame limit is split: the primary frame
//! carries the first chunk plus a header announcing the total size and the
//! address of a dedicated work channel, and the rest flows over that work
//! channel in frames sharing the message id.
//!
//! Work channels are single-use, bypass the backlog and are owned by the
//! channel that created them. They are released once the transfer finishes
//! or fails, and any left over are closed with their owner.

use super::Channel;
use crate::config::{ChannelConfig, Direction, Role};
use crate::header::{Frame, Header};
use crate::{CommError, Result};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};
use uuid::Uuid;

/// Frames worth of reassembly buffer reserved up front
const PREALLOCATED_FRAMES: usize = 64;

/// Live work channels of one owner, keyed by message id
#[derive(Debug, Default)]
pub(crate) struct WorkChannels {
    live: Mutex<HashMap<Uuid, Channel>>,
}

impl WorkChannels {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, id: Uuid, channel: Channel) -> Result<()> {
        let mut live = self.live.lock();
        if live.contains_key(&id) {
            return Err(CommError::usage(format!(
                "work channel for message {} already registered",
                id
            )));
        }
        live.insert(id, channel);
        Ok(())
    }

    pub(crate) fn get(&self, id: &Uuid) -> Option<Channel> {
        self.live.lock().get(id).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Remove and close the work channel of message `id`
    pub(crate) async fn release(&self, id: &Uuid) {
        let channel = self.live.lock().remove(id);
        if let Some(channel) = channel {
            channel.shutdown().await;
            trace!(%id, "Work channel released");
        }
    }

    /// Close every remaining work channel
    pub(crate) async fn close_all(&self) {
        let channels: Vec<Channel> = self.live.lock().drain().map(|(_, c)| c).collect();
        if !channels.is_empty() {
            debug!(count = channels.len(), "Closing leftover work channels");
        }
        for channel in channels {
            channel.shutdown().await;
        }
    }
}

impl Channel {
    fn work_config(&self, address: Option<&str>, role: Role) -> ChannelConfig {
        let parent = self.config();
        let config = ChannelConfig {
            transport: parent.transport,
            max_frame_size: Some(self.max_frame_size()),
            drain_timeout_ms: parent.drain_timeout_ms,
            recv_timeout_ms: parent.recv_timeout_ms,
            backlog_sleep_ms: parent.backlog_sleep_ms,
            work_timeout_ms: parent.work_timeout_ms,
            ..ChannelConfig::default()
        }
        .with_single_use(true)
        .with_dont_backlog(true)
        .with_role(role);

        match address {
            Some(address) => config.with_address(address),
            None => config.with_generated_address(),
        }
    }

    /// Work channel of the same transport family as this channel
    ///
    /// The sending side owns a generated address and binds it; the receiving
    /// side connects to the address announced in the header.
    fn create_work_channel(&self, direction: Direction, address: Option<&str>) -> Result<Channel> {
        let role = match direction {
            Direction::Send => Role::Bind,
            Direction::Recv => Role::Connect,
        };
        Channel::new(
            format!("{}_work", self.name()),
            direction,
            self.work_config(address, role),
            Arc::clone(self.factory()),
        )
    }

    /// Announce an oversized message on this channel and stream the rest
    /// over a fresh work channel
    ///
    /// With a backlog the remainder is streamed by a background task that
    /// owns the work channel, and this returns once the first frame is
    /// accepted. Without one both legs complete before returning.
    pub(super) async fn send_chunked(&self, mut header: Header, payload: Bytes) -> Result<()> {
        let id = header.id;
        let work = self.create_work_channel(Direction::Send, None)?;
        self.core.work.register(id, work.clone())?;
        debug!(
            channel = %self.name(),
            work = %work.address(),
            size = payload.len(),
            "Sending oversized message over work channel"
        );

        let announced: Result<()> = async {
            work.open().await?;
            header.mark_incomplete(payload.len(), work.address());
            self.dispatch(&Frame::new(header, payload.slice(..self.max_frame_size())))
                .await
        }
        .await;
        if let Err(e) = announced {
            self.core.work.release(&id).await;
            return Err(e);
        }

        if self.core.backlog.is_none() {
            let result = self.stream_remainder(&work, id, &payload).await;
            self.core.work.release(&id).await;
            return result;
        }

        let owner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = owner.stream_remainder(&work, id, &payload).await {
                warn!(
                    channel = %owner.name(),
                    work = %work.address(),
                    %id,
                    error = %e,
                    "Remainder of oversized message not delivered"
                );
            }
            owner.core.work.release(&id).await;
        });
        Ok(())
    }

    /// Everything after the first chunk, bounded by the work timeout
    async fn stream_remainder(&self, work: &Channel, id: Uuid, payload: &Bytes) -> Result<()> {
        let chunk_size = self.max_frame_size();
        let deadline = Instant::now() + self.config().work_timeout();
        let mut offset = chunk_size;
        while offset < payload.len() {
            let end = (offset + chunk_size).min(payload.len());
            let frame = Frame::new(Header::with_id(id), payload.slice(offset..end)).encode()?;
            work.send_frame_until(&frame, deadline).await?;
            offset = end;
        }
        trace!(channel = %self.name(), %id, "Oversized message streamed");
        Ok(())
    }

    /// Push one encoded frame, retrying "try again" until `deadline`
    async fn send_frame_until(&self, frame: &[u8], deadline: Instant) -> Result<()> {
        loop {
            match self.core.transport.send_direct(frame).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && Instant::now() < deadline => {
                    tokio::time::sleep(self.config().backlog_sleep()).await
                }
                Err(e) if e.is_transient() => {
                    return Err(CommError::timeout(
                        "work channel send",
                        self.config().work_timeout_ms,
                    ))
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(super) async fn recv_chunked(&self, header: &Header, first: Bytes) -> Result<Bytes> {
        let id = header.id;
        let (size, address) = match (header.size, header.address.as_deref()) {
            (Some(size), Some(address)) => (size, address),
            _ => return Err(CommError::protocol("incomplete header without size or address")),
        };
        let limit = self.config().max_message_size;
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size <= limit && *size > first.len())
            .ok_or_else(|| {
                CommError::protocol(format!(
                    "message {} announces {} bytes; accepted range is {}..={}",
                    id,
                    size,
                    first.len() + 1,
                    limit
                ))
            })?;

        let work = match self.core.work.get(&id) {
            Some(work) => work,
            None => {
                let work = self.create_work_channel(Direction::Recv, Some(address))?;
                self.core.work.register(id, work.clone())?;
                work
            }
        };
        trace!(channel = %self.name(), work = %address, size, "Receiving remainder over work channel");

        let result: Result<Bytes> = async {
            work.open().await?;
            let timeout = self.config().work_timeout();
            let deadline = Instant::now() + timeout;

            let reserve = self.max_frame_size().saturating_mul(PREALLOCATED_FRAMES);
            let mut buffer = BytesMut::with_capacity(size.min(reserve));
            buffer.extend_from_slice(&first);
            while buffer.len() < size {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(CommError::timeout(
                        "work channel receive",
                        timeout.as_millis() as u64,
                    ));
                }
                if let Some(frame) = work.next_frame(remaining).await? {
                    if frame.header.id != id {
                        return Err(CommError::protocol(format!(
                            "work channel for message {} received frame of {}",
                            id, frame.header.id
                        )));
                    }
                    buffer.extend_from_slice(&frame.payload);
                }
            }
            if buffer.len() != size {
                return Err(CommError::protocol(format!(
                    "message {} announced {} bytes but carried {}",
                    id,
                    size,
                    buffer.len()
                )));
            }
            Ok(buffer.freeze())
        }
        .await;

        self.core.work.release(&id).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryFactory, MemoryHub};
    use crate::transport::TransportFactory;
    use std::time::Duration;

    fn channel(factory: &Arc<dyn TransportFactory>, direction: Direction) -> Channel {
        let config = ChannelConfig::default()
            .with_address("mem-work-test")
            .with_max_frame_size(8);
        Channel::new("owner", direction, config, Arc::clone(factory)).unwrap()
    }

    #[tokio::test]
    async fn test_register_rejects_duplicate_id() {
        let factory: Arc<dyn TransportFactory> =
            Arc::new(MemoryFactory::new(Arc::new(MemoryHub::default())));
        let owner = channel(&factory, Direction::Send);
        let work = owner.create_work_channel(Direction::Send, None).unwrap();

        let works = WorkChannels::new();
        let id = Uuid::new_v4();
        works.register(id, work.clone()).unwrap();
        assert!(works.register(id, work).unwrap_err().is_usage());
        assert_eq!(works.len(), 1);

        works.release(&id).await;
        assert_eq!(works.len(), 0);
    }

    #[tokio::test]
    async fn test_work_channel_shape() {
        let factory: Arc<dyn TransportFactory> =
            Arc::new(MemoryFactory::new(Arc::new(MemoryHub::default())));
        let owner = channel(&factory, Direction::Send);

        let work = owner.create_work_channel(Direction::Send, None).unwrap();
        assert!(work.is_single_use());
        assert!(!work.config().backlog_enabled());
        assert_eq!(work.role(), Role::Bind);
        assert_eq!(work.max_frame_size(), 8);
        assert_ne!(work.address(), owner.address());

        let peer = owner
            .create_work_channel(Direction::Recv, Some(work.address()))
            .unwrap();
        assert_eq!(peer.role(), Role::Connect);
        assert_eq!(peer.address(), work.address());
    }

    #[tokio::test]
    async fn test_close_all_shuts_leftovers() {
        let factory: Arc<dyn TransportFactory> =
            Arc::new(MemoryFactory::new(Arc::new(MemoryHub::default())));
        let owner = channel(&factory, Direction::Send);
        let work = owner.create_work_channel(Direction::Send, None).unwrap();
        work.open().await.unwrap();

        let works = WorkChannels::new();
        works.register(Uuid::new_v4(), work.clone()).unwrap();
        works.close_all().await;
        assert!(work.is_closed());
        assert_eq!(works.len(), 0);
    }

    #[tokio::test]
    async fn test_missing_remainder_times_out() {
        let factory: Arc<dyn TransportFactory> =
            Arc::new(MemoryFactory::new(Arc::new(MemoryHub::default())));
        let config = ChannelConfig::default()
            .with_address("mem-work-timeout")
            .with_max_frame_size(8)
            .with_work_timeout(Duration::from_millis(30));
        let rx = Channel::new("rx", Direction::Recv, config, Arc::clone(&factory)).unwrap();

        let mut header = Header::new();
        header.mark_incomplete(64, "mem-work-nobody");
        let err = rx
            .recv_chunked(&header, Bytes::from_static(b"12345678"))
            .await
            .unwrap_err();
        assert!(matches!(err, CommError::Timeout { .. }));
        assert_eq!(rx.work_channel_count(), 0);
    }

    #[tokio::test]
    async fn test_announced_size_out_of_range_is_rejected() {
        let factory: Arc<dyn TransportFactory> =
            Arc::new(MemoryFactory::new(Arc::new(MemoryHub::default())));
        let config = ChannelConfig::default()
            .with_address("mem-work-hostile")
            .with_max_frame_size(8)
            .with_max_message_size(1024);
        let tx = Channel::new("tx", Direction::Send, config.clone(), Arc::clone(&factory)).unwrap();
        let rx = Channel::new("rx", Direction::Recv, config, Arc::clone(&factory)).unwrap();
        tx.open().await.unwrap();

        for size in [usize::MAX, 4096] {
            let mut header = Header::new();
            header.mark_incomplete(size, "mem-work-nobody");
            let frame = Frame::new(header, Bytes::from_static(b"12345678"))
                .encode()
                .unwrap();
            tx.core.transport.send_direct(&frame).await.unwrap();

            let err = rx.recv(Duration::from_secs(1)).await.unwrap_err();
            assert!(matches!(err, CommError::Protocol { .. }));
            assert_eq!(rx.work_channel_count(), 0);
        }
    }

    #[tokio::test]
    async fn test_failed_plain_transfer_releases_work_channel() {
        let hub = Arc::new(MemoryHub::new(4, 1024));
        let factory: Arc<dyn TransportFactory> = Arc::new(MemoryFactory::new(hub));
        let config = ChannelConfig::default()
            .with_address("mem-work-stalled")
            .with_max_frame_size(16)
            .with_dont_backlog(true)
            .with_work_timeout(Duration::from_millis(50));
        let tx = Channel::new("tx", Direction::Send, config, factory).unwrap();

        let err = tx.send(vec![b'x'; 1000]).await.unwrap_err();
        assert!(matches!(err, CommError::Timeout { .. }));
        assert!(!err.is_transient());
        assert_eq!(tx.work_channel_count(), 0);
    }
}
