//! Client Channel
//!
//! Sends requests through the server's registry entry. Each request carries
//! the address of a fresh single-use response channel; responses are
//! collected in request order.

use super::registry::{ServerLease, ServerRegistry};
use crate::channel::{Channel, Received, SendOptions};
use crate::config::{ChannelConfig, Direction, Role};
use crate::transport::TransportFactory;
use crate::{CommError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Send-direction channel with request/response semantics
#[derive(Debug)]
pub struct ClientChannel {
    request: Channel,
    factory: Arc<dyn TransportFactory>,
    registry: Arc<ServerRegistry>,
    lease: ServerLease,
    response_config: ChannelConfig,
    responses: Mutex<VecDeque<Channel>>,
    closed: AtomicBool,
}

impl ClientChannel {
    /// Sign on to the server named by `config` and build the request channel
    pub async fn new(
        name: impl Into<String>,
        config: ChannelConfig,
        factory: Arc<dyn TransportFactory>,
        registry: Arc<ServerRegistry>,
    ) -> Result<Self> {
        let name = name.into();
        config.validate()?;
        let server = config.resolve_address(&name, Direction::Send, factory.as_ref())?;
        let lease = registry
            .sign_on(&factory, &server.address, config.backlog_sleep())
            .await?;

        let request_config = config
            .clone()
            .with_address(lease.client_address())
            .with_role(Role::Connect);
        let request = match Channel::new(name, Direction::Send, request_config, Arc::clone(&factory)) {
            Ok(request) => request,
            Err(e) => {
                registry.sign_off(&lease).await;
                return Err(e);
            }
        };

        let response_config = ChannelConfig {
            role: None,
            ..config
        }
        .with_generated_address()
        .with_role(Role::Bind)
        .with_single_use(true);

        debug!(
            client = %request.name(),
            server = %lease.address(),
            client_address = %lease.client_address(),
            "Client signed on"
        );

        Ok(Self {
            request,
            factory,
            registry,
            lease,
            response_config,
            responses: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        self.request.name()
    }

    /// Address of the server
    pub fn address(&self) -> &str {
        self.lease.address()
    }

    /// Private address requests are sent to
    pub fn client_address(&self) -> &str {
        self.lease.client_address()
    }

    pub fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.request.is_open()
    }

    /// Requests whose response has not been collected
    pub fn pending_responses(&self) -> usize {
        self.responses.lock().len()
    }

    /// Underlying request channel
    pub fn request_channel(&self) -> &Channel {
        &self.request
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CommError::closed(self.request.name()))
        } else {
            Ok(())
        }
    }

    /// Send a request; its response is collected by a later `recv`
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        let response = Channel::new(
            format!("{}_response", self.request.name()),
            Direction::Recv,
            self.response_config.clone(),
            Arc::clone(&self.factory),
        )?;
        response.open().await?;

        let options = SendOptions {
            response_address: Some(response.address().to_string()),
        };
        match self.request.send_with(payload, options).await {
            Ok(()) => {
                trace!(client = %self.request.name(), response = %response.address(), "Request sent");
                self.responses.lock().push_back(response);
                Ok(())
            }
            Err(e) => {
                let _ = response.close(false).await;
                Err(e)
            }
        }
    }

    /// Collect the response to the oldest outstanding request
    ///
    /// `Empty` leaves the request outstanding.
    pub async fn recv(&self, timeout: Duration) -> Result<Received> {
        self.ensure_open()?;
        let response = self.responses.lock().pop_front().ok_or_else(|| {
            CommError::usage(format!(
                "client '{}' has no outstanding request to receive a response for",
                self.request.name()
            ))
        })?;

        match response.recv(timeout).await {
            Ok(Received::Empty) => {
                self.responses.lock().push_front(response);
                Ok(Received::Empty)
            }
            Ok(received) => {
                response.close(false).await?;
                Ok(received)
            }
            Err(e) => {
                let _ = response.close(false).await;
                Err(e)
            }
        }
    }

    /// Send a request and wait up to `timeout` for its response
    pub async fn call(&self, payload: impl Into<Bytes>, timeout: Duration) -> Result<Received> {
        self.send(payload).await?;
        self.recv(timeout).await
    }

    /// `call` bounded by the configured receive timeout
    pub async fn call_default(&self, payload: impl Into<Bytes>) -> Result<Received> {
        self.call(payload, self.request.config().recv_timeout()).await
    }

    pub async fn send_eof(&self) -> Result<()> {
        self.ensure_open()?;
        self.request.send_eof().await
    }

    /// Close the request channel and outstanding response channels, then
    /// sign off from the server registry
    pub async fn close(&self, drain: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.request.close(drain).await;

        let pending: Vec<Channel> = self.responses.lock().drain(..).collect();
        for response in pending {
            let _ = response.close(false).await;
        }

        self.registry.sign_off(&self.lease).await;
        debug!(client = %self.request.name(), server = %self.lease.address(), "Client signed off");
        result
    }
}

/// A client dropped without `close` signs off in the background
impl Drop for ClientChannel {
    fn drop(&mut self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let request = self.request.clone();
        let pending: Vec<Channel> = self.responses.lock().drain(..).collect();
        let registry = Arc::clone(&self.registry);
        let lease = self.lease.clone();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let _ = request.close(false).await;
                    for response in pending {
                        let _ = response.close(false).await;
                    }
                    registry.sign_off(&lease).await;
                    debug!(client = %request.name(), server = %lease.address(), "Dropped client signed off");
                });
            }
            Err(_) => warn!(
                client = %self.request.name(),
                server = %self.lease.address(),
                "Client dropped outside a runtime; entry stays until registry shutdown"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryFactory, MemoryHub};
    use crate::transport::TransportKind;

    fn setup() -> (Arc<dyn TransportFactory>, Arc<ServerRegistry>) {
        let factory: Arc<dyn TransportFactory> =
            Arc::new(MemoryFactory::new(Arc::new(MemoryHub::default())));
        (factory, Arc::new(ServerRegistry::new()))
    }

    #[tokio::test]
    async fn test_recv_without_request_is_usage_error() {
        let (factory, registry) = setup();
        let config = ChannelConfig::default().with_address("mem-client-usage");
        let client = ClientChannel::new("client", config, factory, registry)
            .await
            .unwrap();
        let err = client.recv(Duration::ZERO).await.unwrap_err();
        assert!(err.is_usage());
        client.close(false).await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_request_stays_outstanding() {
        let (factory, registry) = setup();
        let config = ChannelConfig::default().with_address("mem-client-pending");
        let client = ClientChannel::new("client", config, factory, registry)
            .await
            .unwrap();

        client.send("anyone?").await.unwrap();
        assert!(client.recv(Duration::from_millis(10)).await.unwrap().is_empty());
        assert_eq!(client.pending_responses(), 1);
        client.close(false).await.unwrap();
        assert_eq!(client.pending_responses(), 0);
    }

    #[tokio::test]
    async fn test_close_signs_off() {
        let (factory, registry) = setup();
        let config = ChannelConfig::default().with_address("mem-client-signoff");
        let first = ClientChannel::new("a", config.clone(), Arc::clone(&factory), Arc::clone(&registry))
            .await
            .unwrap();
        let second = ClientChannel::new("b", config, factory, Arc::clone(&registry))
            .await
            .unwrap();
        assert_eq!(first.client_address(), second.client_address());
        assert_eq!(
            registry.client_count(TransportKind::Memory, "mem-client-signoff").await,
            2
        );

        first.close(false).await.unwrap();
        first.close(false).await.unwrap();
        assert_eq!(
            registry.client_count(TransportKind::Memory, "mem-client-signoff").await,
            1
        );
        assert!(matches!(first.send("x").await, Err(CommError::Closed { .. })));

        second.close(false).await.unwrap();
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_dropped_client_signs_off() {
        let (factory, registry) = setup();
        let config = ChannelConfig::default().with_address("mem-client-drop");
        let client = ClientChannel::new("client", config, factory, Arc::clone(&registry))
            .await
            .unwrap();
        assert_eq!(
            registry
                .client_count(TransportKind::Memory, "mem-client-drop")
                .await,
            1
        );

        drop(client);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !registry.is_empty().await && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(registry.is_empty().await);
    }
}
