//! Communication Layer
//!
//! Transport-agnostic message channels. A `Channel` wraps one transport
//! adapter and adds the behavior every transport shares: framing, backlog
//! buffering, chunking of oversized messages over work channels, end of
//! stream, single-use channels and drain-on-close. On top of channels sit
//! request/response channels (`ClientChannel`/`ServerChannel`) and the
//! `Bundle`/`Fork` aggregates. Shared state lives in a `CommContext`.
//!
//! ```no_run
//! use comm::{CommContext, Direction, Received};
//! use std::time::Duration;
//!
//! # async fn run() -> comm::Result<()> {
//! let context = CommContext::default();
//! let config = context.config().with_address("mem-example");
//! let tx = context.channel("producer", Direction::Send, config.clone()).await?;
//! let rx = context.channel("consumer", Direction::Recv, config).await?;
//!
//! tx.send("hello").await?;
//! if let Received::Message(payload) = rx.recv(Duration::from_secs(1)).await? {
//!     assert_eq!(payload, "hello");
//! }
//! context.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod config;
pub mod header;
pub mod transport;
pub mod channel;
pub mod rpc;
pub mod aggregate;
pub mod context;

// Re-export commonly used types
pub use error::{CommError, Result};
pub use config::{AddressSpec, ChannelConfig, Direction, Role};
pub use header::{Frame, Header, WireFormat};
pub use transport::{TransportAdapter, TransportFactory, TransportKind};
pub use channel::{Channel, ChannelState, ChannelStats, Received, SendOptions};
pub use rpc::{ClientChannel, ServerChannel, ServerRegistry};
pub use aggregate::{AggregateChannel, Bundle, Fork};
pub use context::{ChannelRegistry, CommContext};

pub use comm_config::{comm as constants, CommSettings};
