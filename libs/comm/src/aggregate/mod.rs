//! Aggregate Channels
//!
//! `Bundle` and `Fork` present several child channels as one. Sends are
//! broadcast to every child in order. Receives round-robin over the children
//! from a rotating cursor; end of stream is reported only once every child
//! has delivered its own EOF. The aggregate is open while any child is.
//!
//! Child addresses are carried as one compound address joined with
//! `ADDRESS_SEPARATOR`.

use crate::channel::{Channel, Received};
use crate::config::Direction;
use crate::{CommError, Result};
use bytes::Bytes;
use comm_config::comm::ADDRESS_SEPARATOR;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

pub mod bundle;
pub mod fork;

pub use bundle::{Bundle, BundleMember};
pub use fork::Fork;

/// Interval between polling rounds over the children
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Join child addresses into one compound address
pub fn join_addresses<S: AsRef<str>>(addresses: &[S]) -> String {
    let parts: Vec<&str> = addresses.iter().map(|address| address.as_ref()).collect();
    parts.join(ADDRESS_SEPARATOR)
}

/// Recover the child addresses of a compound address
pub fn split_addresses(address: &str) -> Vec<String> {
    address
        .split(ADDRESS_SEPARATOR)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Receive-side progress of one child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildStatus {
    Live,
    Eof,
    Failed,
}

/// Channel-shaped wrapper over a set of children
#[derive(Debug)]
pub struct AggregateChannel {
    name: String,
    direction: Direction,
    children: Vec<Channel>,
    cursor: AtomicUsize,
    status: Mutex<Vec<ChildStatus>>,
}

impl AggregateChannel {
    pub(crate) fn new(name: impl Into<String>, children: Vec<Channel>) -> Result<Self> {
        let name = name.into();
        let direction = match children.first() {
            Some(first) => first.direction(),
            None => {
                return Err(CommError::configuration(
                    format!("aggregate channel '{}' needs at least one child", name),
                    Some("children"),
                ))
            }
        };
        if children.iter().any(|child| child.direction() != direction) {
            return Err(CommError::configuration(
                format!("children of '{}' must share one direction", name),
                Some("direction"),
            ));
        }

        let count = children.len();
        debug!(aggregate = %name, %direction, children = count, "Aggregate channel created");
        Ok(Self {
            name,
            direction,
            children,
            cursor: AtomicUsize::new(0),
            status: Mutex::new(vec![ChildStatus::Live; count]),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn children(&self) -> &[Channel] {
        &self.children
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Compound address of all children
    pub fn address(&self) -> String {
        let addresses: Vec<&str> = self.children.iter().map(Channel::address).collect();
        join_addresses(&addresses)
    }

    /// True while any child is open
    pub fn is_open(&self) -> bool {
        self.children.iter().any(Channel::is_open)
    }

    /// True once every child is closed
    pub fn is_closed(&self) -> bool {
        self.children.iter().all(Channel::is_closed)
    }

    /// True once every child has delivered EOF
    pub fn eof_received(&self) -> bool {
        self.status.lock().iter().all(|status| *status == ChildStatus::Eof)
    }

    /// True once no child can deliver anything more
    fn exhausted(&self) -> bool {
        self.status.lock().iter().all(|status| *status != ChildStatus::Live)
    }

    pub fn n_drain(&self) -> usize {
        self.children.iter().map(Channel::n_drain).sum()
    }

    pub async fn open(&self) -> Result<()> {
        for child in &self.children {
            child.open().await?;
        }
        Ok(())
    }

    /// Send to every child; stops at the first failure
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        for child in &self.children {
            child.send(payload.clone()).await?;
        }
        Ok(())
    }

    /// Send EOF on every child; stops at the first failure
    pub async fn send_eof(&self) -> Result<()> {
        for child in &self.children {
            child.send_eof().await?;
        }
        Ok(())
    }

    /// Next message from any child, waiting up to `timeout`
    ///
    /// A child that fails is skipped from then on. EOF is reported once
    /// every child has delivered it; when the remaining children have failed
    /// instead, the aggregate reports itself closed.
    pub async fn recv(&self, timeout: Duration) -> Result<Received> {
        if self.direction != Direction::Recv {
            return Err(CommError::usage(format!(
                "cannot recv on {} aggregate '{}'",
                self.direction, self.name
            )));
        }
        let deadline = Instant::now() + timeout;
        let count = self.children.len();
        loop {
            if let Some(done) = self.finished() {
                return done;
            }

            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
            for offset in 0..count {
                let index = (start + offset) % count;
                if self.status.lock()[index] != ChildStatus::Live {
                    continue;
                }
                match self.children[index].recv(Duration::ZERO).await {
                    Ok(Received::Message(payload)) => return Ok(Received::Message(payload)),
                    Ok(Received::Eof) => {
                        self.status.lock()[index] = ChildStatus::Eof;
                        debug!(aggregate = %self.name, child = index, "Child reached EOF");
                    }
                    Ok(Received::Empty) => {}
                    Err(e) if e.is_transient() => {}
                    Err(e) => {
                        self.status.lock()[index] = ChildStatus::Failed;
                        warn!(
                            aggregate = %self.name,
                            child = %self.children[index].name(),
                            error = %e,
                            "Child failed; receiving from the rest"
                        );
                    }
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.finished().unwrap_or(Ok(Received::Empty));
            }
            tokio::time::sleep(remaining.min(POLL_INTERVAL)).await;
        }
    }

    /// Outcome once no child is live
    fn finished(&self) -> Option<Result<Received>> {
        if self.eof_received() {
            debug!(aggregate = %self.name, "All children reached EOF");
            Some(Ok(Received::Eof))
        } else if self.exhausted() {
            Some(Err(CommError::closed(&self.name)))
        } else {
            None
        }
    }

    /// Close every child concurrently; reports the first failure
    pub async fn close(&self, drain: bool) -> Result<()> {
        let results =
            futures::future::join_all(self.children.iter().map(|child| child.close(drain))).await;
        debug!(aggregate = %self.name, "Aggregate channel closed");
        results.into_iter().collect()
    }
}
