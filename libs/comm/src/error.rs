//! Communication Error Types
//!
//! Error taxonomy for channels and transports. Transport failures surface as
//! `Err` values from `send`/`recv`; configuration and usage errors are
//! separate variants so callers can tell programming defects apart from
//! runtime conditions.

use thiserror::Error;

/// Main communication error type
#[derive(Error, Debug)]
pub enum CommError {
    /// Construction-time configuration errors (missing address, bad limits)
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Misuse of the API: a programming defect, never retried
    #[error("Usage error: {message}")]
    Usage { message: String },

    /// Operation on a channel that has been closed
    #[error("Channel '{channel}' is closed")]
    Closed { channel: String },

    /// Hard transport failures
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Connection establishment errors
    #[error("Connection error: {message} (address: {address:?})")]
    Connection {
        message: String,
        address: Option<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Framing and header errors
    #[error("Protocol error: {message}")]
    Protocol {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Timeout errors
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Transport temporarily full: "try again"
    #[error("Resource exhausted: {resource}: {message}")]
    ResourceExhausted { resource: String, message: String },

    /// Abstract operation a transport adapter did not provide
    #[error("Feature '{feature}' not implemented: {reason}")]
    NotImplemented { feature: String, reason: String },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for communication operations
pub type Result<T> = std::result::Result<T, CommError>;

impl CommError {
    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a usage error
    pub fn usage(message: impl Into<String>) -> Self {
        Self::Usage {
            message: message.into(),
        }
    }

    /// Create a closed-channel error
    pub fn closed(channel: impl Into<String>) -> Self {
        Self::Closed {
            channel: channel.into(),
        }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, address: Option<&str>) -> Self {
        Self::Connection {
            message: message.into(),
            address: address.map(|s| s.to_string()),
            source: None,
        }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
            source: None,
        }
    }

    /// Create a protocol error with source
    pub fn protocol_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Protocol {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a "try again" error for a transport at capacity
    pub fn resource_exhausted(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ResourceExhausted {
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Create a not implemented error
    pub fn not_implemented(feature: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::NotImplemented {
            feature: feature.into(),
            reason: reason.into(),
        }
    }

    /// Transient errors are the transport's "try again" and are retried
    /// locally by the backlog engine
    pub fn is_transient(&self) -> bool {
        matches!(self, CommError::ResourceExhausted { .. })
    }

    /// Usage errors indicate a programming defect in the caller
    pub fn is_usage(&self) -> bool {
        matches!(self, CommError::Usage { .. })
    }

    /// Fatal errors must not be handled as runtime conditions
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CommError::Configuration { .. } | CommError::Usage { .. } | CommError::NotImplemented { .. }
        )
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            CommError::Configuration { .. } => "configuration",
            CommError::Usage { .. } => "usage",
            CommError::Closed { .. } => "closed",
            CommError::Transport { .. } => "transport",
            CommError::Connection { .. } => "connection",
            CommError::Protocol { .. } => "protocol",
            CommError::Timeout { .. } => "timeout",
            CommError::ResourceExhausted { .. } => "resource_exhausted",
            CommError::NotImplemented { .. } => "not_implemented",
            CommError::Io { .. } => "io",
        }
    }
}

// Custom Clone implementation since Box<dyn Error> doesn't implement Clone
impl Clone for CommError {
    fn clone(&self) -> Self {
        match self {
            CommError::Configuration { message, field } => CommError::Configuration {
                message: message.clone(),
                field: field.clone(),
            },
            CommError::Usage { message } => CommError::Usage {
                message: message.clone(),
            },
            CommError::Closed { channel } => CommError::Closed {
                channel: channel.clone(),
            },
            CommError::Transport { message, .. } => CommError::Transport {
                message: message.clone(),
                source: None, // Source errors are not cloneable, so we omit them
            },
            CommError::Connection {
                message, address, ..
            } => CommError::Connection {
                message: message.clone(),
                address: address.clone(),
                source: None,
            },
            CommError::Protocol { message, .. } => CommError::Protocol {
                message: message.clone(),
                source: None,
            },
            CommError::Timeout {
                operation,
                timeout_ms,
            } => CommError::Timeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            CommError::ResourceExhausted { resource, message } => CommError::ResourceExhausted {
                resource: resource.clone(),
                message: message.clone(),
            },
            CommError::NotImplemented { feature, reason } => CommError::NotImplemented {
                feature: feature.clone(),
                reason: reason.clone(),
            },
            CommError::Io { message, source } => CommError::Io {
                message: message.clone(),
                source: std::io::Error::new(source.kind(), message.as_str()),
            },
        }
    }
}

/// Convert standard I/O errors to communication errors
impl From<std::io::Error> for CommError {
    fn from(error: std::io::Error) -> Self {
        CommError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}

/// Convert bincode errors to communication errors
impl From<bincode::Error> for CommError {
    fn from(error: bincode::Error) -> Self {
        CommError::protocol_with_source("Header serialization failed", error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categorization() {
        assert_eq!(CommError::protocol("test").category(), "protocol");
        assert_eq!(CommError::timeout("recv", 5000).category(), "timeout");
        assert_eq!(CommError::closed("a").category(), "closed");
        assert_eq!(CommError::usage("twice").category(), "usage");
    }

    #[test]
    fn test_transient_errors() {
        assert!(CommError::resource_exhausted("queue", "full").is_transient());
        assert!(!CommError::timeout("work channel send", 10).is_transient());
        assert!(!CommError::transport("dropped").is_transient());
        assert!(!CommError::protocol("bad magic").is_transient());
    }

    #[test]
    fn test_fatal_errors() {
        assert!(CommError::usage("send before recv").is_fatal());
        assert!(CommError::configuration("missing address", Some("address")).is_fatal());
        assert!(CommError::not_implemented("recv_direct", "send-only").is_fatal());
        assert!(!CommError::transport("dropped").is_fatal());
        assert!(!CommError::closed("a").is_fatal());
    }

    #[test]
    fn test_clone_drops_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let err = CommError::transport_with_source("write failed", io_err);
        match err.clone() {
            CommError::Transport { message, source } => {
                assert_eq!(message, "write failed");
                assert!(source.is_none());
            }
            other => panic!("Expected Transport error, got {:?}", other),
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        match CommError::from(io_err) {
            CommError::Io { message, .. } => assert!(message.contains("refused")),
            other => panic!("Expected Io error, got {:?}", other),
        }
    }
}
