//! Backlog Engine
//!
//! Decouples application-facing `send`/`recv` from transport readiness. A
//! sending backlog buffers frames the transport cannot take yet and a
//! background task flushes them in FIFO order. A receiving backlog pulls
//! frames off the transport as they arrive and wakes blocked receivers.
//!
//! A hard transport failure stops the background task. The owning channel is
//! not closed; subsequent operations report the failure.

use crate::config::Direction;
use crate::transport::TransportAdapter;
use crate::{CommError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Idle wait of the send loop before re-checking its buffer
const IDLE_WAIT: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub(crate) struct Backlog {
    direction: Direction,
    buffer: Mutex<VecDeque<Bytes>>,
    ready: Notify,
    running: AtomicBool,
    failed: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
    sleep: Duration,
}

impl Backlog {
    pub(crate) fn new(direction: Direction, sleep: Duration) -> Self {
        Self {
            direction,
            buffer: Mutex::new(VecDeque::new()),
            ready: Notify::new(),
            running: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            handle: Mutex::new(None),
            sleep,
        }
    }

    /// Spawn the background task; no-op if already started
    pub(crate) fn start(self: &Arc<Self>, transport: Arc<dyn TransportAdapter>, channel: &str) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.running.store(true, Ordering::Release);

        let backlog = Arc::clone(self);
        let channel = channel.to_string();
        *handle = Some(match self.direction {
            Direction::Send => tokio::spawn(run_send_loop(backlog, transport, channel)),
            Direction::Recv => tokio::spawn(run_recv_loop(backlog, transport, channel)),
        });
        debug!(direction = %self.direction, "Backlog started");
    }

    /// Stop the background task; returns how many frames were left behind
    pub(crate) fn stop(&self) -> usize {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
        self.ready.notify_waiters();
        self.clear()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Drop buffered frames; returns how many were dropped
    pub(crate) fn clear(&self) -> usize {
        let mut buffer = self.buffer.lock();
        let dropped = buffer.len();
        buffer.clear();
        dropped
    }

    fn push(&self, frame: Bytes) {
        self.buffer.lock().push_back(frame);
        self.ready.notify_one();
    }

    fn fail(&self) {
        self.failed.store(true, Ordering::Release);
        self.running.store(false, Ordering::Release);
        self.ready.notify_waiters();
    }

    /// Send one frame, buffering it when the transport reports "try again"
    ///
    /// A frame is only sent directly when nothing is queued ahead of it.
    pub(crate) async fn send(&self, frame: Bytes, transport: &dyn TransportAdapter) -> Result<()> {
        if self.has_failed() {
            return Err(CommError::transport(
                "send backlog stopped after a transport failure",
            ));
        }

        if self.len() == 0 {
            match transport.send_direct(&frame).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() => {
                    trace!(error = %e, "Transport busy, queueing frame");
                }
                Err(e) => return Err(e),
            }
        }
        self.push(frame);
        Ok(())
    }

    /// Next received frame, waiting up to `timeout`
    pub(crate) async fn recv(&self, timeout: Duration) -> Result<Option<Bytes>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.buffer.lock().pop_front() {
                return Ok(Some(frame));
            }
            if self.has_failed() {
                return Err(CommError::transport(
                    "receive backlog stopped after a transport failure",
                ));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, self.ready.notified()).await;
        }
    }
}

async fn run_send_loop(backlog: Arc<Backlog>, transport: Arc<dyn TransportAdapter>, channel: String) {
    while backlog.is_running() {
        let head = backlog.buffer.lock().front().cloned();
        let Some(frame) = head else {
            let _ = tokio::time::timeout(IDLE_WAIT, backlog.ready.notified()).await;
            continue;
        };

        match transport.send_direct(&frame).await {
            Ok(()) => {
                let mut buffer = backlog.buffer.lock();
                // purge may have replaced the head while the send was in flight
                if buffer.front().map_or(false, |f| f.as_ptr() == frame.as_ptr()) {
                    buffer.pop_front();
                }
                trace!(channel = %channel, remaining = buffer.len(), "Backlog frame flushed");
            }
            Err(e) if e.is_transient() => tokio::time::sleep(backlog.sleep).await,
            Err(e) => {
                warn!(channel = %channel, error = %e, pending = backlog.len(), "Send backlog stopped");
                backlog.fail();
                break;
            }
        }
    }
}

async fn run_recv_loop(backlog: Arc<Backlog>, transport: Arc<dyn TransportAdapter>, channel: String) {
    while backlog.is_running() {
        match transport.recv_direct().await {
            Ok(Some(frame)) => backlog.push(frame),
            Ok(None) => tokio::time::sleep(backlog.sleep).await,
            Err(e) if e.is_transient() => tokio::time::sleep(backlog.sleep).await,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Receive backlog stopped");
                backlog.fail();
                break;
            }
        }
    }
}
