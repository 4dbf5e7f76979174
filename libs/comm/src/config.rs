//! Channel configuration
//!
//! `ChannelConfig` carries every per-channel policy: which transport family
//! backs the channel, where its address comes from, frame limits, backlog
//! and single-use behavior, EOF policies and the timeouts of the blocking
//! operations.

use crate::transport::{TransportFactory, TransportKind};
use crate::{CommError, Result};
use comm_config::{comm, CommSettings};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Direction of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Send,
    Recv,
}

impl Direction {
    /// Suffix of the environment variable holding this direction's address
    pub fn env_suffix(self) -> &'static str {
        match self {
            Direction::Send => comm::SEND_ENV_SUFFIX,
            Direction::Recv => comm::RECV_ENV_SUFFIX,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => write!(f, "send"),
            Direction::Recv => write!(f, "recv"),
        }
    }
}

/// Which end of an address performs the bind
///
/// The end that owns an address listens on it; the peer attaches to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Bind,
    Connect,
}

/// Where a channel's address comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AddressSpec {
    /// Read from `<NAME>_IN` / `<NAME>_OUT` (falling back to `<NAME>`)
    #[default]
    Env,
    /// Use the given address
    Explicit(String),
    /// Generate a fresh address owned by this channel
    Generate,
}

/// Address resolved at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAddress {
    pub address: String,
    pub generated: bool,
}

/// Per-channel configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Transport family backing the channel
    pub transport: TransportKind,
    /// Address source
    pub address: AddressSpec,
    /// Explicit bind/connect role; derived from the address source when unset
    pub role: Option<Role>,
    /// Maximum payload bytes per frame; the transport limit when unset
    pub max_frame_size: Option<usize>,
    /// Largest message accepted for reassembly
    pub max_message_size: usize,
    /// Bypass the backlog engine and block on the transport
    pub dont_backlog: bool,
    /// The channel carries exactly one message
    pub single_use: bool,
    pub close_on_eof_send: bool,
    pub close_on_eof_recv: bool,
    pub drain_timeout_ms: u64,
    pub recv_timeout_ms: u64,
    pub backlog_sleep_ms: u64,
    pub work_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Memory,
            address: AddressSpec::Env,
            role: None,
            max_frame_size: None,
            max_message_size: comm::DEFAULT_MAX_MESSAGE_SIZE,
            dont_backlog: false,
            single_use: false,
            close_on_eof_send: false,
            close_on_eof_recv: false,
            drain_timeout_ms: comm::DEFAULT_DRAIN_TIMEOUT_MS,
            recv_timeout_ms: comm::DEFAULT_RECV_TIMEOUT_MS,
            backlog_sleep_ms: comm::DEFAULT_BACKLOG_SLEEP_MS,
            work_timeout_ms: comm::DEFAULT_WORK_TIMEOUT_MS,
        }
    }
}

impl ChannelConfig {
    /// Channel defaults taken from loaded settings
    pub fn from_settings(settings: &CommSettings) -> Self {
        Self {
            max_frame_size: Some(settings.max_frame_size),
            max_message_size: settings.max_message_size,
            drain_timeout_ms: settings.drain_timeout_ms,
            recv_timeout_ms: settings.recv_timeout_ms,
            backlog_sleep_ms: settings.backlog_sleep_ms,
            work_timeout_ms: settings.work_timeout_ms,
            ..Self::default()
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = AddressSpec::Explicit(address.into());
        self
    }

    pub fn with_generated_address(mut self) -> Self {
        self.address = AddressSpec::Generate;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = Some(max_frame_size);
        self
    }

    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }

    pub fn with_dont_backlog(mut self, dont_backlog: bool) -> Self {
        self.dont_backlog = dont_backlog;
        self
    }

    pub fn with_single_use(mut self, single_use: bool) -> Self {
        self.single_use = single_use;
        self
    }

    pub fn with_close_on_eof_send(mut self, close: bool) -> Self {
        self.close_on_eof_send = close;
        self
    }

    pub fn with_close_on_eof_recv(mut self, close: bool) -> Self {
        self.close_on_eof_recv = close;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_work_timeout(mut self, timeout: Duration) -> Self {
        self.work_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Single-use channels always bypass the backlog
    pub fn backlog_enabled(&self) -> bool {
        !self.dont_backlog && !self.single_use
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn backlog_sleep(&self) -> Duration {
        Duration::from_millis(self.backlog_sleep_ms.max(1))
    }

    pub fn work_timeout(&self) -> Duration {
        Duration::from_millis(self.work_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_size == Some(0) {
            return Err(CommError::configuration(
                "max_frame_size cannot be zero",
                Some("max_frame_size"),
            ));
        }
        if self.max_message_size == 0 {
            return Err(CommError::configuration(
                "max_message_size cannot be zero",
                Some("max_message_size"),
            ));
        }
        if let AddressSpec::Explicit(address) = &self.address {
            if address.trim().is_empty() {
                return Err(CommError::configuration(
                    "explicit address cannot be empty",
                    Some("address"),
                ));
            }
        }
        Ok(())
    }

    /// Resolve the channel address
    ///
    /// Failure to resolve is a construction-time configuration error.
    pub fn resolve_address(
        &self,
        name: &str,
        direction: Direction,
        factory: &dyn TransportFactory,
    ) -> Result<ResolvedAddress> {
        match &self.address {
            AddressSpec::Explicit(address) => Ok(ResolvedAddress {
                address: address.clone(),
                generated: false,
            }),
            AddressSpec::Generate => Ok(ResolvedAddress {
                address: factory.generate_address(),
                generated: true,
            }),
            AddressSpec::Env => {
                let suffixed = format!("{}{}", name, direction.env_suffix());
                let address = std::env::var(&suffixed)
                    .or_else(|_| std::env::var(name))
                    .map_err(|_| {
                        CommError::configuration(
                            format!(
                                "No address for channel '{}': set {} or {}",
                                name, suffixed, name
                            ),
                            Some("address"),
                        )
                    })?;
                Ok(ResolvedAddress {
                    address,
                    generated: false,
                })
            }
        }
    }

    /// Role used when none is configured: the owner of a generated address
    /// binds, otherwise receivers bind and senders connect.
    pub fn effective_role(&self, direction: Direction, generated: bool) -> Role {
        match self.role {
            Some(role) => role,
            None if generated => Role::Bind,
            None => match direction {
                Direction::Recv => Role::Bind,
                Direction::Send => Role::Connect,
            },
        }
    }
}
