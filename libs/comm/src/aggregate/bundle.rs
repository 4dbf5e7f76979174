//! Bundle: heterogeneous children, each with its own address and transport

use super::{split_addresses, AggregateChannel};
use crate::channel::Channel;
use crate::config::{ChannelConfig, Direction};
use crate::transport::TransportFactory;
use crate::Result;
use std::ops::Deref;
use std::sync::Arc;

/// One child of a bundle
#[derive(Debug, Clone)]
pub struct BundleMember {
    pub config: ChannelConfig,
    pub factory: Arc<dyn TransportFactory>,
}

impl BundleMember {
    pub fn new(config: ChannelConfig, factory: Arc<dyn TransportFactory>) -> Self {
        Self { config, factory }
    }
}

/// Independently addressed channels combined under one name
#[derive(Debug)]
pub struct Bundle {
    inner: AggregateChannel,
}

impl Bundle {
    /// Build one child per member, named `<name>_<index>`
    pub fn new(name: impl Into<String>, direction: Direction, members: Vec<BundleMember>) -> Result<Self> {
        let name = name.into();
        let children = members
            .into_iter()
            .enumerate()
            .map(|(index, member)| {
                Channel::new(format!("{}_{}", name, index), direction, member.config, member.factory)
            })
            .collect::<Result<Vec<_>>>()?;
        Self::from_channels(name, children)
    }

    /// Bundle already constructed channels
    pub fn from_channels(name: impl Into<String>, children: Vec<Channel>) -> Result<Self> {
        Ok(Self {
            inner: AggregateChannel::new(name, children)?,
        })
    }

    /// Rebuild a bundle from its compound address; children share `config`
    /// and `factory`
    pub fn from_address(
        name: impl Into<String>,
        direction: Direction,
        address: &str,
        config: ChannelConfig,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        let members = split_addresses(address)
            .into_iter()
            .map(|child| BundleMember::new(config.clone().with_address(child), Arc::clone(&factory)))
            .collect();
        Self::new(name, direction, members)
    }
}

impl Deref for Bundle {
    type Target = AggregateChannel;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
