//! Channel
//!
//! A `Channel` is a directional message endpoint backed by one transport
//! adapter. It owns the uniform contract every transport shares: lifecycle
//! (`bind`/`open`/`close`), framing, chunking of oversized messages through
//! work channels, end-of-stream handling, single-use enforcement and
//! delivery confirmation.
//!
//! Lifecycle: `Unopened -> Bound -> Open -> Closing -> Closed`. `Closed` is
//! absorbing. `send`/`recv` on an unopened channel open it first.
//!
//! Unless configured with `dont_backlog` (or `single_use`), a channel runs a
//! backlog engine so `send` never blocks on transport capacity and `recv`
//! waits on a "data available" signal instead of polling the transport.

use crate::config::{ChannelConfig, Direction, Role};
use crate::header::{Frame, Header};
use crate::transport::{TransportAdapter, TransportFactory, TransportKind};
use crate::{CommError, Result};
use bytes::Bytes;
use comm_config::comm::EOF_SENTINEL;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

pub mod backlog;
pub mod work;

use backlog::Backlog;
use work::WorkChannels;

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Unopened,
    Bound,
    Open,
    Closing,
    Closed,
}

/// Outcome of a receive
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    /// A complete message
    Message(Bytes),
    /// Nothing arrived within the timeout; more may arrive later
    Empty,
    /// The peer signalled end of stream; nothing more will arrive
    Eof,
}

impl Received {
    pub fn is_message(&self) -> bool {
        matches!(self, Received::Message(_))
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Received::Empty)
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Received::Eof)
    }

    /// Payload of a message, if this is one
    pub fn into_payload(self) -> Option<Bytes> {
        match self {
            Received::Message(payload) => Some(payload),
            _ => None,
        }
    }
}

/// Per-message send options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendOptions {
    /// Address the peer should answer on
    pub response_address: Option<String>,
}

/// Snapshot of channel activity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStats {
    pub state: ChannelState,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub eof_sent: bool,
    pub eof_received: bool,
    pub n_direct: usize,
    pub n_backlog: usize,
    pub work_channels: usize,
}

#[derive(Debug)]
struct Lifecycle {
    state: ChannelState,
    used: bool,
    eof_sent: bool,
    eof_received: bool,
}

#[derive(Debug, Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Counters {
    fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

pub(crate) struct ChannelCore {
    name: String,
    address: String,
    direction: Direction,
    role: Role,
    config: ChannelConfig,
    factory: Arc<dyn TransportFactory>,
    transport: Arc<dyn TransportAdapter>,
    max_frame_size: usize,
    lifecycle: Mutex<Lifecycle>,
    backlog: Option<Arc<Backlog>>,
    work: WorkChannels,
    last_header: Mutex<Option<Header>>,
    counters: Counters,
}

impl Drop for ChannelCore {
    fn drop(&mut self) {
        if let Some(backlog) = &self.backlog {
            backlog.stop();
        }
    }
}

/// Directional, transport-backed message endpoint
///
/// Cloning a `Channel` yields another handle to the same endpoint.
#[derive(Clone)]
pub struct Channel {
    core: Arc<ChannelCore>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.core.name)
            .field("address", &self.core.address)
            .field("direction", &self.core.direction)
            .field("transport", &self.core.transport.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    /// Create a channel; resolves the address but performs no I/O
    pub fn new(
        name: impl Into<String>,
        direction: Direction,
        config: ChannelConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        config.validate()?;
        if factory.kind() != config.transport {
            return Err(CommError::configuration(
                format!(
                    "channel configured for {} transport but given a {} factory",
                    config.transport,
                    factory.kind()
                ),
                Some("transport"),
            ));
        }

        let name = name.into();
        let resolved = config.resolve_address(&name, direction, factory.as_ref())?;
        let role = config.effective_role(direction, resolved.generated);
        let transport = factory.create(&resolved.address, direction, role)?;
        let max_frame_size = config
            .max_frame_size
            .map_or(transport.max_frame_size(), |limit| {
                limit.min(transport.max_frame_size())
            });
        if max_frame_size == 0 {
            return Err(CommError::configuration(
                "transport reports a zero frame size",
                Some("max_frame_size"),
            ));
        }

        let backlog = config
            .backlog_enabled()
            .then(|| Arc::new(Backlog::new(direction, config.backlog_sleep())));

        debug!(
            channel = %name,
            address = %resolved.address,
            %direction,
            ?role,
            max_frame_size,
            backlog = backlog.is_some(),
            "Channel created"
        );

        Ok(Self {
            core: Arc::new(ChannelCore {
                name,
                address: resolved.address,
                direction,
                role,
                config,
                factory,
                transport,
                max_frame_size,
                lifecycle: Mutex::new(Lifecycle {
                    state: ChannelState::Unopened,
                    used: false,
                    eof_sent: false,
                    eof_received: false,
                }),
                backlog,
                work: WorkChannels::new(),
                last_header: Mutex::new(None),
                counters: Counters::default(),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<ChannelCore> {
        Arc::downgrade(&self.core)
    }

    pub(crate) fn from_core(core: Arc<ChannelCore>) -> Self {
        Self { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn address(&self) -> &str {
        &self.core.address
    }

    pub fn direction(&self) -> Direction {
        self.core.direction
    }

    pub fn role(&self) -> Role {
        self.core.role
    }

    pub fn transport_kind(&self) -> TransportKind {
        self.core.transport.kind()
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.core.config
    }

    pub(crate) fn factory(&self) -> &Arc<dyn TransportFactory> {
        &self.core.factory
    }

    /// Effective payload limit of one frame
    pub fn max_frame_size(&self) -> usize {
        self.core.max_frame_size
    }

    pub fn state(&self) -> ChannelState {
        self.core.lifecycle.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open && self.core.transport.is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    pub fn is_single_use(&self) -> bool {
        self.core.config.single_use
    }

    pub fn eof_sent(&self) -> bool {
        self.core.lifecycle.lock().eof_sent
    }

    pub fn eof_received(&self) -> bool {
        self.core.lifecycle.lock().eof_received
    }

    /// Header of the most recently received frame
    pub fn last_header(&self) -> Option<Header> {
        self.core.last_header.lock().clone()
    }

    /// Live work channels owned by this channel
    pub fn work_channel_count(&self) -> usize {
        self.core.work.len()
    }

    /// Frames visible to the transport that have not been consumed
    pub fn n_direct(&self) -> usize {
        if self.core.transport.is_open() {
            self.core.transport.pending_count()
        } else {
            0
        }
    }

    /// Frames buffered by the backlog engine
    pub fn n_backlog(&self) -> usize {
        self.core.backlog.as_ref().map_or(0, |backlog| backlog.len())
    }

    /// Frames that must be gone before a draining close can finish, plus
    /// oversized transfers still streaming
    pub fn n_drain(&self) -> usize {
        self.n_direct() + self.n_backlog() + self.work_channel_count()
    }

    pub fn stats(&self) -> ChannelStats {
        let (state, eof_sent, eof_received) = {
            let lifecycle = self.core.lifecycle.lock();
            (lifecycle.state, lifecycle.eof_sent, lifecycle.eof_received)
        };
        let counters = &self.core.counters;
        ChannelStats {
            state,
            messages_sent: counters.messages_sent.load(Ordering::Relaxed),
            messages_received: counters.messages_received.load(Ordering::Relaxed),
            bytes_sent: counters.bytes_sent.load(Ordering::Relaxed),
            bytes_received: counters.bytes_received.load(Ordering::Relaxed),
            eof_sent,
            eof_received,
            n_direct: self.n_direct(),
            n_backlog: self.n_backlog(),
            work_channels: self.work_channel_count(),
        }
    }

    /// Reserve addressing resources without starting data flow
    pub fn bind(&self) -> Result<()> {
        let mut lifecycle = self.core.lifecycle.lock();
        match lifecycle.state {
            ChannelState::Unopened => {
                lifecycle.state = ChannelState::Bound;
                debug!(channel = %self.core.name, address = %self.core.address, "Channel bound");
                Ok(())
            }
            ChannelState::Bound | ChannelState::Open => Ok(()),
            ChannelState::Closing | ChannelState::Closed => Err(CommError::closed(&self.core.name)),
        }
    }

    /// Bind if needed and activate the transport; no-op when already open
    pub async fn open(&self) -> Result<()> {
        match self.state() {
            ChannelState::Open => return Ok(()),
            ChannelState::Closing | ChannelState::Closed => {
                return Err(CommError::closed(&self.core.name))
            }
            ChannelState::Unopened | ChannelState::Bound => {}
        }

        self.bind()?;
        self.core.transport.open().await.map_err(|e| {
            warn!(channel = %self.core.name, address = %self.core.address, error = %e, "Transport failed to open");
            e
        })?;

        if let Some(backlog) = &self.core.backlog {
            backlog.start(Arc::clone(&self.core.transport), &self.core.name);
        }

        let mut lifecycle = self.core.lifecycle.lock();
        if lifecycle.state == ChannelState::Bound {
            lifecycle.state = ChannelState::Open;
            debug!(channel = %self.core.name, address = %self.core.address, "Channel opened");
        }
        Ok(())
    }

    async fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ChannelState::Open => Ok(()),
            ChannelState::Unopened | ChannelState::Bound => self.open().await,
            ChannelState::Closing | ChannelState::Closed => Err(CommError::closed(&self.core.name)),
        }
    }

    fn check_direction(&self, expected: Direction) -> Result<()> {
        if self.core.direction == expected {
            Ok(())
        } else {
            Err(CommError::usage(format!(
                "cannot {} on {} channel '{}'",
                expected, self.core.direction, self.core.name
            )))
        }
    }

    /// Mark a single-use channel as used; the second use fails permanently
    fn claim_use(&self) -> Result<()> {
        let mut lifecycle = self.core.lifecycle.lock();
        if self.core.config.single_use && lifecycle.used {
            return Err(CommError::usage(format!(
                "single-use channel '{}' was already used",
                self.core.name
            )));
        }
        lifecycle.used = true;
        Ok(())
    }

    fn log_failure(&self, operation: &str, err: &CommError) {
        match err {
            CommError::Closed { .. } => {
                debug!(channel = %self.core.name, operation, "Operation on closed channel")
            }
            e if e.is_fatal() => {
                error!(channel = %self.core.name, operation, error = %e, "Fatal channel error")
            }
            e => warn!(
                channel = %self.core.name,
                address = %self.core.address,
                operation,
                category = e.category(),
                error = %e,
                "Channel operation failed"
            ),
        }
    }

    /// Send one message
    ///
    /// A payload equal to the EOF sentinel is sent as end of stream.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.send_with(payload, SendOptions::default()).await
    }

    /// Send one message with per-message options
    pub async fn send_with(&self, payload: impl Into<Bytes>, options: SendOptions) -> Result<()> {
        let payload = payload.into();
        self.check_direction(Direction::Send)?;
        if payload.as_ref() == EOF_SENTINEL {
            return self.send_eof().await;
        }

        let result = self.send_message(payload.clone(), options).await;
        match &result {
            Ok(()) => {
                self.core.counters.record_sent(payload.len());
                trace!(channel = %self.core.name, bytes = payload.len(), "Message sent");
            }
            Err(e) => self.log_failure("send", e),
        }
        result
    }

    async fn send_message(&self, payload: Bytes, options: SendOptions) -> Result<()> {
        self.ensure_open().await?;
        self.claim_use()?;

        let header = Header::new().with_response_address(options.response_address);
        if payload.len() > self.core.max_frame_size {
            self.send_chunked(header, payload).await
        } else {
            self.dispatch(&Frame::new(header, payload)).await
        }
    }

    /// Hand one frame to the backlog engine or straight to the transport
    async fn dispatch(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode()?;
        match &self.core.backlog {
            Some(backlog) => backlog.send(encoded, self.core.transport.as_ref()).await,
            None => self.core.transport.send_direct(&encoded).await,
        }
    }

    /// Signal end of stream; sending EOF again is a no-op
    pub async fn send_eof(&self) -> Result<()> {
        self.check_direction(Direction::Send)?;
        self.ensure_open().await?;
        {
            let mut lifecycle = self.core.lifecycle.lock();
            if lifecycle.eof_sent {
                trace!(channel = %self.core.name, "EOF already sent");
                return Ok(());
            }
            if self.core.config.single_use && lifecycle.used {
                return Err(CommError::usage(format!(
                    "single-use channel '{}' was already used",
                    self.core.name
                )));
            }
            lifecycle.eof_sent = true;
            lifecycle.used = true;
        }

        if let Err(e) = self.dispatch(&Frame::eof()).await {
            self.core.lifecycle.lock().eof_sent = false;
            self.log_failure("send_eof", &e);
            return Err(e);
        }
        debug!(channel = %self.core.name, "EOF sent");

        if self.core.config.close_on_eof_send {
            self.close(true).await?;
        }
        Ok(())
    }

    /// Receive one message, waiting up to `timeout` (zero polls once)
    pub async fn recv(&self, timeout: Duration) -> Result<Received> {
        let result = self.recv_message(timeout).await;
        match &result {
            Ok(Received::Message(payload)) => {
                self.core.counters.record_received(payload.len());
                trace!(channel = %self.core.name, bytes = payload.len(), "Message received");
            }
            Ok(_) => {}
            Err(e) => self.log_failure("recv", e),
        }
        result
    }

    /// Receive with the configured default timeout
    pub async fn recv_default(&self) -> Result<Received> {
        self.recv(self.core.config.recv_timeout()).await
    }

    async fn recv_message(&self, timeout: Duration) -> Result<Received> {
        self.check_direction(Direction::Recv)?;
        self.ensure_open().await?;
        if self.core.config.single_use && self.core.lifecycle.lock().used {
            return Err(CommError::usage(format!(
                "single-use channel '{}' was already used",
                self.core.name
            )));
        }

        let frame = match self.next_frame(timeout).await? {
            Some(frame) => frame,
            None => return Ok(Received::Empty),
        };
        self.claim_use()?;
        *self.core.last_header.lock() = Some(frame.header.clone());

        if frame.is_eof() {
            return self.on_eof().await;
        }

        let payload = if frame.header.incomplete {
            self.recv_chunked(&frame.header, frame.payload).await?
        } else {
            frame.payload
        };
        Ok(Received::Message(payload))
    }

    async fn on_eof(&self) -> Result<Received> {
        let first = {
            let mut lifecycle = self.core.lifecycle.lock();
            !std::mem::replace(&mut lifecycle.eof_received, true)
        };
        if first {
            debug!(channel = %self.core.name, "EOF received");
        }
        if self.core.config.close_on_eof_recv {
            self.close(false).await?;
        }
        Ok(Received::Eof)
    }

    /// Next decoded frame from the backlog or the transport
    pub(crate) async fn next_frame(&self, timeout: Duration) -> Result<Option<Frame>> {
        let raw = match &self.core.backlog {
            Some(backlog) => backlog.recv(timeout).await?,
            None => self.poll_direct(timeout).await?,
        };
        raw.map(|bytes| Frame::decode(&bytes)).transpose()
    }

    async fn poll_direct(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let deadline = Instant::now() + timeout;
        let sleep = self.core.config.backlog_sleep();
        loop {
            if let Some(frame) = self.core.transport.recv_direct().await? {
                return Ok(Some(frame));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(sleep)).await;
        }
    }

    /// Wait until nothing is left to drain; false on timeout
    pub async fn drain_messages(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let sleep = self.core.config.backlog_sleep();
        loop {
            if self.n_drain() == 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(sleep).await;
        }
    }

    /// Discard buffered frames (and, for receivers, frames waiting in the
    /// transport); returns how many were dropped
    pub async fn purge(&self) -> usize {
        let mut purged = self
            .core
            .backlog
            .as_ref()
            .map_or(0, |backlog| backlog.clear());

        if self.core.direction == Direction::Recv && self.core.transport.is_open() {
            while let Ok(Some(_)) = self.core.transport.recv_direct().await {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!(channel = %self.core.name, purged, "Channel purged");
        }
        purged
    }

    pub async fn confirm_send(&self) -> Result<bool> {
        self.core.transport.confirm_send().await
    }

    pub async fn confirm_recv(&self) -> Result<bool> {
        self.core.transport.confirm_recv().await
    }

    /// Poll the transport's confirmation until it succeeds or `timeout` ends
    pub async fn wait_for_confirm(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            let confirmed = match self.core.direction {
                Direction::Send => self.confirm_send().await?,
                Direction::Recv => self.confirm_recv().await?,
            };
            if confirmed {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(self.core.config.backlog_sleep()).await;
        }
    }

    /// Close the channel
    ///
    /// With `drain`, a sending channel first waits (bounded by the drain
    /// timeout) for outstanding frames to be consumed. Safe to call more than
    /// once and from any task.
    pub async fn close(&self, drain: bool) -> Result<()> {
        let was_open = {
            let mut lifecycle = self.core.lifecycle.lock();
            match lifecycle.state {
                ChannelState::Closing | ChannelState::Closed => return Ok(()),
                ChannelState::Open => {
                    lifecycle.state = ChannelState::Closing;
                    true
                }
                ChannelState::Unopened | ChannelState::Bound => {
                    lifecycle.state = ChannelState::Closing;
                    false
                }
            }
        };

        if drain && was_open && self.core.direction == Direction::Send {
            let timeout = self.core.config.drain_timeout();
            if !self.drain_messages(timeout).await {
                warn!(
                    channel = %self.core.name,
                    remaining = self.n_drain(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Drain did not complete before close"
                );
            }
        }

        self.core.work.close_all().await;
        self.shutdown().await;
        Ok(())
    }

    /// Stop the backlog, release the transport and mark the channel closed
    pub(crate) async fn shutdown(&self) {
        self.core.lifecycle.lock().state = ChannelState::Closing;
        if let Some(backlog) = &self.core.backlog {
            let dropped = backlog.stop();
            if dropped > 0 && self.core.direction == Direction::Send {
                warn!(channel = %self.core.name, dropped, "Closing with undelivered frames");
            }
        }
        if let Err(e) = self.core.transport.close().await {
            warn!(channel = %self.core.name, error = %e, "Transport failed to close cleanly");
        }
        self.core.lifecycle.lock().state = ChannelState::Closed;
        debug!(channel = %self.core.name, address = %self.core.address, "Channel closed");
    }
}
