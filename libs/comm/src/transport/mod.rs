//! Transport Adapter Layer
//!
//! A transport adapter provides the minimal primitive I/O of one concrete
//! mechanism. Channels never talk to sockets or queues directly; they drive
//! a `TransportAdapter` and create new adapters of the same family through a
//! `TransportFactory` when they need work or response channels.
//!
//! Adapters report "try again" (capacity full, peer not yet attached) as
//! `CommError::ResourceExhausted`; any other error is a hard failure.

use crate::config::{Direction, Role};
use crate::{CommError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

pub mod memory;
pub mod unix;

pub use memory::{MemoryFactory, MemoryHub, MemoryTransport};
pub use unix::{UnixFactory, UnixTransport};

/// Transport family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// In-process queues
    #[default]
    Memory,
    /// Unix domain stream sockets
    Unix,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Memory => write!(f, "memory"),
            TransportKind::Unix => write!(f, "unix"),
        }
    }
}

/// Primitive I/O contract implemented by every concrete transport
#[async_trait]
pub trait TransportAdapter: Send + Sync + fmt::Debug {
    /// Transport family
    fn kind(&self) -> TransportKind;

    /// Address this adapter is attached to
    fn address(&self) -> &str;

    /// Activate the adapter
    async fn open(&self) -> Result<()>;

    /// Release the adapter; idempotent
    async fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Put one encoded frame on the transport
    async fn send_direct(&self, _frame: &[u8]) -> Result<()> {
        Err(CommError::not_implemented(
            "send_direct",
            format!("{} transport cannot send", self.kind()),
        ))
    }

    /// Take one waiting frame, if any, without blocking
    async fn recv_direct(&self) -> Result<Option<Bytes>> {
        Err(CommError::not_implemented(
            "recv_direct",
            format!("{} transport cannot receive", self.kind()),
        ))
    }

    /// Frames visible to the transport that have not been consumed
    ///
    /// Transports that cannot count cheaply may approximate with 0/1.
    fn pending_count(&self) -> usize;

    /// Largest payload a single frame may carry
    fn max_frame_size(&self) -> usize;

    /// Delivery acknowledgement for sent frames
    async fn confirm_send(&self) -> Result<bool> {
        Ok(true)
    }

    /// Acknowledgement that received frames were processed
    async fn confirm_recv(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Creates adapters and addresses for one transport family
pub trait TransportFactory: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Fresh address nobody else is using
    fn generate_address(&self) -> String;

    /// Adapter attached to `address`; performs no I/O until opened
    fn create(
        &self,
        address: &str,
        direction: Direction,
        role: Role,
    ) -> Result<Arc<dyn TransportAdapter>>;
}
