//! Server Channel
//!
//! Receives requests and answers each on the response address its header
//! carried. Response addresses are queued in arrival order; `send` answers
//! the oldest request through a single-use channel discarded right after.

use crate::channel::{Channel, Received};
use crate::config::{ChannelConfig, Direction, Role};
use crate::transport::TransportFactory;
use crate::{CommError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Recv-direction channel with request/response semantics
#[derive(Debug)]
pub struct ServerChannel {
    requests: Channel,
    factory: Arc<dyn TransportFactory>,
    response_config: ChannelConfig,
    response_addresses: Mutex<VecDeque<String>>,
}

impl ServerChannel {
    pub fn new(
        name: impl Into<String>,
        config: ChannelConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let requests = Channel::new(name, Direction::Recv, config.clone(), Arc::clone(&factory))?;
        let response_config = ChannelConfig {
            role: None,
            ..config
        }
        .with_role(Role::Connect)
        .with_single_use(true);

        Ok(Self {
            requests,
            factory,
            response_config,
            response_addresses: Mutex::new(VecDeque::new()),
        })
    }

    pub fn name(&self) -> &str {
        self.requests.name()
    }

    pub fn address(&self) -> &str {
        self.requests.address()
    }

    pub fn is_open(&self) -> bool {
        self.requests.is_open()
    }

    /// Requests received but not yet answered
    pub fn pending_responses(&self) -> usize {
        self.response_addresses.lock().len()
    }

    /// Underlying request channel
    pub fn request_channel(&self) -> &Channel {
        &self.requests
    }

    pub async fn open(&self) -> Result<()> {
        self.requests.open().await
    }

    /// Receive the next request
    pub async fn recv(&self, timeout: Duration) -> Result<Received> {
        let received = self.requests.recv(timeout).await?;
        if received.is_message() {
            match self.requests.last_header().and_then(|h| h.response_address) {
                Some(address) => {
                    trace!(server = %self.requests.name(), response = %address, "Request received");
                    self.response_addresses.lock().push_back(address);
                }
                None => debug!(server = %self.requests.name(), "Request carries no response address"),
            }
        }
        Ok(received)
    }

    pub async fn recv_default(&self) -> Result<Received> {
        self.recv(self.requests.config().recv_timeout()).await
    }

    /// Answer the oldest unanswered request
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        let address = self.response_addresses.lock().pop_front().ok_or_else(|| {
            CommError::usage(format!(
                "server '{}' has no request to respond to",
                self.requests.name()
            ))
        })?;

        let response = Channel::new(
            format!("{}_response", self.requests.name()),
            Direction::Send,
            self.response_config.clone().with_address(address),
            Arc::clone(&self.factory),
        )?;
        let result = response.send(payload).await;
        if let Err(e) = response.close(false).await {
            warn!(server = %self.requests.name(), error = %e, "Failed to discard response channel");
        }
        result
    }

    /// Close the request channel; unanswered requests are dropped
    pub async fn close(&self, drain: bool) -> Result<()> {
        let dropped = {
            let mut addresses = self.response_addresses.lock();
            let dropped = addresses.len();
            addresses.clear();
            dropped
        };
        if dropped > 0 {
            debug!(server = %self.requests.name(), dropped, "Closing with unanswered requests");
        }
        self.requests.close(drain).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryFactory, MemoryHub};

    #[tokio::test]
    async fn test_send_before_recv_is_usage_error() {
        let factory: Arc<dyn TransportFactory> =
            Arc::new(MemoryFactory::new(Arc::new(MemoryHub::default())));
        let server = ServerChannel::new(
            "server",
            ChannelConfig::default().with_address("mem-server-usage"),
            factory,
        )
        .unwrap();

        let err = server.send("pong").await.unwrap_err();
        assert!(err.is_usage());
        server.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_requests_answered_in_arrival_order() {
        let hub = Arc::new(MemoryHub::default());
        let factory: Arc<dyn TransportFactory> = Arc::new(MemoryFactory::new(Arc::clone(&hub)));
        let server = ServerChannel::new(
            "server",
            ChannelConfig::default().with_address("mem-server-order"),
            Arc::clone(&factory),
        )
        .unwrap();
        server.open().await.unwrap();

        let request = Channel::new(
            "requester",
            Direction::Send,
            ChannelConfig::default().with_address("mem-server-order"),
            Arc::clone(&factory),
        )
        .unwrap();
        let mut replies = Vec::new();
        for i in 0..2 {
            let reply = Channel::new(
                format!("reply{}", i),
                Direction::Recv,
                ChannelConfig::default().with_generated_address(),
                Arc::clone(&factory),
            )
            .unwrap();
            reply.open().await.unwrap();
            request
                .send_with(
                    format!("q{}", i),
                    crate::channel::SendOptions {
                        response_address: Some(reply.address().to_string()),
                    },
                )
                .await
                .unwrap();
            replies.push(reply);
        }

        for _ in 0..2 {
            assert!(server.recv(Duration::from_secs(1)).await.unwrap().is_message());
        }
        assert_eq!(server.pending_responses(), 2);
        server.send("a0").await.unwrap();
        server.send("a1").await.unwrap();

        for (i, reply) in replies.iter().enumerate() {
            let answer = reply.recv(Duration::from_secs(1)).await.unwrap();
            assert_eq!(answer.into_payload().unwrap(), Bytes::from(format!("a{}", i)));
        }
    }
}
