//! Communication Context
//!
//! Process-scoped owner of the shared communication state: the registry of
//! live channels, the server registry, the in-process queue hub and the
//! transport factories. Create one at startup, pass it to whatever needs
//! channels, and call `shutdown` before exit.

use crate::aggregate::bundle::{Bundle, BundleMember};
use crate::aggregate::Fork;
use crate::channel::{Channel, ChannelCore};
use crate::config::{ChannelConfig, Direction};
use crate::rpc::{ClientChannel, ServerChannel, ServerRegistry};
use crate::transport::{MemoryFactory, MemoryHub, TransportFactory, TransportKind, UnixFactory};
use crate::{CommError, Result};
use comm_config::{load_settings, CommSettings};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Live channels keyed by transport, name and direction
///
/// Holds weak references; a channel dropped by every owner disappears on
/// the next `prune`.
#[derive(Debug, Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Weak<ChannelCore>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry key of a channel
    pub fn key(kind: TransportKind, name: &str, direction: Direction) -> String {
        format!("{}://{}/{}", kind, name, direction)
    }

    pub fn register(&self, key: impl Into<String>, channel: &Channel) {
        let key = key.into();
        debug!(key = %key, address = %channel.address(), "Channel registered");
        self.channels.write().insert(key, channel.downgrade());
    }

    pub fn get(&self, key: &str) -> Option<Channel> {
        self.channels
            .read()
            .get(key)
            .and_then(Weak::upgrade)
            .map(Channel::from_core)
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.channels.write().remove(key).is_some()
    }

    /// Registered channels still alive and not closed
    pub fn live(&self) -> Vec<Channel> {
        self.channels
            .read()
            .values()
            .filter_map(Weak::upgrade)
            .map(Channel::from_core)
            .filter(|channel| !channel.is_closed())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    /// Drop entries of channels that were released or closed
    pub fn prune(&self) -> usize {
        let mut channels = self.channels.write();
        let before = channels.len();
        channels.retain(|_, weak| weak.upgrade().map_or(false, |core| !Channel::from_core(core).is_closed()));
        before - channels.len()
    }

    fn clear(&self) {
        self.channels.write().clear();
    }
}

/// Process-scoped communication state
#[derive(Debug)]
pub struct CommContext {
    settings: CommSettings,
    channels: ChannelRegistry,
    servers: Arc<ServerRegistry>,
    memory: Arc<MemoryFactory>,
    unix: Arc<UnixFactory>,
}

impl Default for CommContext {
    fn default() -> Self {
        Self::new(CommSettings::default())
    }
}

impl CommContext {
    pub fn new(settings: CommSettings) -> Self {
        let hub = Arc::new(MemoryHub::new(settings.queue_capacity, settings.max_frame_size));
        let unix = UnixFactory::new(settings.socket_dir.clone(), settings.max_frame_size);
        info!(
            socket_dir = %settings.socket_dir.display(),
            max_frame_size = settings.max_frame_size,
            log_level = %settings.log_level,
            "Communication context created"
        );
        Self {
            settings,
            channels: ChannelRegistry::new(),
            servers: Arc::new(ServerRegistry::new()),
            memory: Arc::new(MemoryFactory::new(hub)),
            unix: Arc::new(unix),
        }
    }

    /// Context from a settings file (optional) plus `COMM_` environment
    /// overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let settings = load_settings(path)
            .map_err(|e| CommError::configuration(format!("{:#}", e), None))?;
        Ok(Self::new(settings))
    }

    pub fn settings(&self) -> &CommSettings {
        &self.settings
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn servers(&self) -> &Arc<ServerRegistry> {
        &self.servers
    }

    pub fn memory_hub(&self) -> &Arc<MemoryHub> {
        self.memory.hub()
    }

    pub fn factory(&self, kind: TransportKind) -> Arc<dyn TransportFactory> {
        match kind {
            TransportKind::Memory => Arc::clone(&self.memory) as Arc<dyn TransportFactory>,
            TransportKind::Unix => Arc::clone(&self.unix) as Arc<dyn TransportFactory>,
        }
    }

    /// Channel defaults derived from the loaded settings
    pub fn config(&self) -> ChannelConfig {
        ChannelConfig::from_settings(&self.settings)
    }

    /// Open channel for `name`/`direction`, reusing a live registered one
    pub async fn channel(
        &self,
        name: &str,
        direction: Direction,
        config: ChannelConfig,
    ) -> Result<Channel> {
        let key = ChannelRegistry::key(config.transport, name, direction);
        if let Some(existing) = self.channels.get(&key) {
            if existing.is_open() {
                return Ok(existing);
            }
        }

        let channel = Channel::new(name, direction, config.clone(), self.factory(config.transport))?;
        channel.open().await?;
        self.channels.register(key, &channel);
        Ok(channel)
    }

    /// Client of the server named by `config`
    pub async fn client(&self, name: &str, config: ChannelConfig) -> Result<ClientChannel> {
        let factory = self.factory(config.transport);
        let client = ClientChannel::new(name, config.clone(), factory, Arc::clone(&self.servers)).await?;
        self.channels.register(
            ChannelRegistry::key(config.transport, name, Direction::Send),
            client.request_channel(),
        );
        Ok(client)
    }

    /// Open server listening at the address named by `config`
    pub async fn server(&self, name: &str, config: ChannelConfig) -> Result<ServerChannel> {
        let factory = self.factory(config.transport);
        let server = ServerChannel::new(name, config.clone(), factory)?;
        server.open().await?;
        self.channels.register(
            ChannelRegistry::key(config.transport, name, Direction::Recv),
            server.request_channel(),
        );
        Ok(server)
    }

    /// Bundle with one child per configuration
    pub fn bundle(
        &self,
        name: &str,
        direction: Direction,
        configs: Vec<ChannelConfig>,
    ) -> Result<Bundle> {
        let members = configs
            .into_iter()
            .map(|config| {
                let factory = self.factory(config.transport);
                BundleMember::new(config, factory)
            })
            .collect();
        let bundle = Bundle::new(name, direction, members)?;
        for (index, child) in bundle.children().iter().enumerate() {
            self.channels.register(
                ChannelRegistry::key(child.transport_kind(), &format!("{}_{}", name, index), direction),
                child,
            );
        }
        Ok(bundle)
    }

    /// Fork of `count` identical children
    pub fn fork(
        &self,
        name: &str,
        direction: Direction,
        count: usize,
        config: ChannelConfig,
    ) -> Result<Fork> {
        let kind = config.transport;
        let fork = Fork::new(name, direction, count, config, self.factory(kind))?;
        for child in fork.children() {
            self.channels
                .register(ChannelRegistry::key(kind, child.name(), direction), child);
        }
        Ok(fork)
    }

    /// Close every live channel, tear down server listeners and drop the
    /// in-process queues
    pub async fn shutdown(&self) {
        let live = self.channels.live();
        let count = live.len();
        let results = futures::future::join_all(live.iter().map(|channel| channel.close(false))).await;
        let failed = results.iter().filter(|result| result.is_err()).count();

        self.servers.shutdown().await;
        self.channels.clear();
        self.memory.hub().clear();
        info!(channels = count, failed, "Communication context shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_channel_creation_is_idempotent_while_open() {
        let context = CommContext::default();
        let config = context.config().with_address("mem-ctx-idem");

        let first = context
            .channel("idem", Direction::Recv, config.clone())
            .await
            .unwrap();
        let again = context
            .channel("idem", Direction::Recv, config.clone())
            .await
            .unwrap();
        assert_eq!(first.address(), again.address());
        assert_eq!(context.channels().live_count(), 1);

        first.close(false).await.unwrap();
        let fresh = context.channel("idem", Direction::Recv, config).await.unwrap();
        assert!(fresh.is_open());
        assert!(!first.is_open());
    }

    #[tokio::test]
    async fn test_registry_prunes_dropped_channels() {
        let context = CommContext::default();
        let config = context.config().with_generated_address();
        {
            let _temporary = context
                .channel("temporary", Direction::Send, config.clone())
                .await
                .unwrap();
        }
        let kept = context.channel("kept", Direction::Send, config).await.unwrap();
        assert_eq!(context.channels().prune(), 1);
        assert_eq!(context.channels().live_count(), 1);
        kept.close(false).await.unwrap();
        assert_eq!(context.channels().prune(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let context = CommContext::default();
        let config = context.config().with_address("mem-ctx-shutdown");
        let tx = context
            .channel("tx", Direction::Send, config.clone())
            .await
            .unwrap();
        let rx = context.channel("rx", Direction::Recv, config).await.unwrap();
        tx.send("left behind").await.unwrap();

        context.shutdown().await;
        assert!(tx.is_closed());
        assert!(rx.is_closed());
        assert_eq!(context.channels().live_count(), 0);
        assert_eq!(context.memory_hub().queue_count(), 0);
        assert!(matches!(
            rx.recv(Duration::ZERO).await,
            Err(CommError::Closed { .. })
        ));
    }
}
