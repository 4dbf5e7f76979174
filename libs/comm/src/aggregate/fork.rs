//! Fork: identical children sharing one transport family, built together

use super::{join_addresses, split_addresses, AggregateChannel};
use crate::channel::Channel;
use crate::config::{AddressSpec, ChannelConfig, Direction, Role};
use crate::transport::TransportFactory;
use crate::{CommError, Result};
use std::ops::Deref;
use std::sync::Arc;
use tracing::debug;

/// Homogeneous fan-out over `count` children
#[derive(Debug)]
pub struct Fork {
    inner: AggregateChannel,
}

impl Fork {
    /// Build `count` children
    ///
    /// With a generated address every child gets a fresh address. Otherwise
    /// the configured address must be a compound address of `count` parts.
    pub fn new(
        name: impl Into<String>,
        direction: Direction,
        count: usize,
        config: ChannelConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let name = name.into();
        if count == 0 {
            return Err(CommError::configuration(
                format!("fork '{}' needs at least one child", name),
                Some("count"),
            ));
        }

        let addresses = match config.address {
            AddressSpec::Generate => (0..count).map(|_| factory.generate_address()).collect(),
            _ => {
                let resolved = config.resolve_address(&name, direction, factory.as_ref())?;
                split_addresses(&resolved.address)
            }
        };
        if addresses.len() != count {
            return Err(CommError::configuration(
                format!(
                    "fork '{}' expects {} addresses, found {}",
                    name,
                    count,
                    addresses.len()
                ),
                Some("address"),
            ));
        }

        // generated addresses belong to this side, so it binds them
        let owned = matches!(config.address, AddressSpec::Generate);
        let children = addresses
            .into_iter()
            .enumerate()
            .map(|(index, address)| {
                let role = config.effective_role(direction, owned);
                let child_config = config.clone().with_address(address).with_role(role);
                Channel::new(format!("{}_{}", name, index), direction, child_config, Arc::clone(&factory))
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(fork = %name, count, "Fork created");
        Ok(Self {
            inner: AggregateChannel::new(name, children)?,
        })
    }

    /// Peer of an existing fork, from the fork's compound address
    pub fn from_address(
        name: impl Into<String>,
        direction: Direction,
        address: &str,
        config: ChannelConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let count = split_addresses(address).len();
        let config = match config.role {
            Some(_) => config,
            None => config.with_role(Role::Connect),
        };
        Self::new(name, direction, count, config.with_address(address), factory)
    }

    /// Addresses of the children, in order
    pub fn addresses(&self) -> Vec<String> {
        self.inner
            .children()
            .iter()
            .map(|child| child.address().to_string())
            .collect()
    }

    /// Compound address to hand to the peer
    pub fn compound_address(&self) -> String {
        join_addresses(&self.addresses())
    }
}

impl Deref for Fork {
    type Target = AggregateChannel;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{MemoryFactory, MemoryHub};
    use std::time::Duration;

    fn factory() -> Arc<dyn TransportFactory> {
        Arc::new(MemoryFactory::new(Arc::new(MemoryHub::default())))
    }

    #[tokio::test]
    async fn test_generated_fork_and_peer() {
        let factory = factory();
        let fork = Fork::new(
            "workers",
            Direction::Send,
            3,
            ChannelConfig::default().with_generated_address(),
            Arc::clone(&factory),
        )
        .unwrap();
        assert_eq!(fork.len(), 3);
        assert!(fork.children().iter().all(|c| c.role() == Role::Bind));
        assert_eq!(fork.children()[2].name(), "workers_2");

        let peer = Fork::from_address(
            "listeners",
            Direction::Recv,
            &fork.compound_address(),
            ChannelConfig::default(),
            Arc::clone(&factory),
        )
        .unwrap();
        assert_eq!(peer.addresses(), fork.addresses());
        assert!(peer.children().iter().all(|c| c.role() == Role::Connect));

        fork.send("task").await.unwrap();
        for child in peer.children() {
            let received = child.recv(Duration::from_secs(1)).await.unwrap();
            assert_eq!(received.into_payload().unwrap(), "task");
        }
    }

    #[test]
    fn test_count_mismatch_rejected() {
        let compound = join_addresses(&["mem-1", "mem-2"]);
        let err = Fork::new(
            "bad",
            Direction::Recv,
            3,
            ChannelConfig::default().with_address(compound),
            factory(),
        )
        .unwrap_err();
        assert!(matches!(err, CommError::Configuration { .. }));
    }

    #[test]
    fn test_zero_children_rejected() {
        let config = ChannelConfig::default().with_generated_address();
        assert!(Fork::new("none", Direction::Send, 0, config, factory()).is_err());
    }
}
