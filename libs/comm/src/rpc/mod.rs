//! Request/Response Channels
//!
//! A `ClientChannel` signs on to the `ServerRegistry` entry of its target and
//! sends every request with the address of a private, single-use response
//! channel. A `ServerChannel` remembers the response address of each request
//! it receives and answers them in order.

pub mod client;
pub mod registry;
pub mod server;

pub use client::ClientChannel;
pub use registry::{ServerLease, ServerRegistry};
pub use server::ServerChannel;
