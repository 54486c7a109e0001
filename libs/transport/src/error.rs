//! Transport Error Types
//!
//! Errors surfaced by the frame codec, the client/server façades and the
//! settings loader. Failures inside the I/O pumps never reach the caller as
//! errors: they close the affected connection and are reported through logs
//! and `Connection::is_connected`.

use std::net::SocketAddr;
use thiserror::Error;

/// Main transport error type
#[derive(Error, Debug)]
pub enum TransportError {
    /// Host name could not be resolved into a socket address
    #[error("Resolve error: {host}:{port}: {message}")]
    Resolve {
        host: String,
        port: u16,
        message: String,
        source: Option<std::io::Error>,
    },

    /// Outbound connect failed
    #[error("Connection error: {message} (remote: {remote_addr:?})")]
    Connection {
        message: String,
        remote_addr: Option<SocketAddr>,
        source: Option<std::io::Error>,
    },

    /// Listener could not be bound
    #[error("Bind error: {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// Framing or handshake violations
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Pop requested more bytes than the message body holds
    #[error("Body underflow: requested {requested} bytes, {available} available")]
    BodyUnderflow { requested: usize, available: usize },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Execution context could not be created or has gone away
    #[error("Runtime error: {message}")]
    Runtime {
        message: String,
        source: Option<std::io::Error>,
    },

    /// Generic I/O errors
    #[error("I/O error: {message}")]
    Io {
        message: String,
        source: std::io::Error,
    },
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

impl TransportError {
    /// Create a resolve error
    pub fn resolve(host: impl Into<String>, port: u16, message: impl Into<String>) -> Self {
        Self::Resolve {
            host: host.into(),
            port,
            message: message.into(),
            source: None,
        }
    }

    /// Create a resolve error with source
    pub fn resolve_with_source(host: impl Into<String>, port: u16, source: std::io::Error) -> Self {
        Self::Resolve {
            host: host.into(),
            port,
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>, remote_addr: Option<SocketAddr>) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        remote_addr: Option<SocketAddr>,
        source: std::io::Error,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            remote_addr,
            source: Some(source),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, source: std::io::Error) -> Self {
        Self::Bind { addr, source }
    }

    /// Create a protocol error
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a body underflow error
    pub fn body_underflow(requested: usize, available: usize) -> Self {
        Self::BodyUnderflow {
            requested,
            available,
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Create a runtime error
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime {
            message: message.into(),
            source: None,
        }
    }

    /// Create a runtime error with source
    pub fn runtime_with_source(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Runtime {
            message: message.into(),
            source: Some(source),
        }
    }

    /// Create an I/O error with context
    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    /// Get error category for log fields
    pub fn category(&self) -> &'static str {
        match self {
            TransportError::Resolve { .. } => "resolve",
            TransportError::Connection { .. } => "connection",
            TransportError::Bind { .. } => "bind",
            TransportError::Protocol { .. } => "protocol",
            TransportError::BodyUnderflow { .. } => "body_underflow",
            TransportError::Configuration { .. } => "configuration",
            TransportError::Runtime { .. } => "runtime",
            TransportError::Io { .. } => "io",
        }
    }
}

/// Convert standard I/O errors to transport errors
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        TransportError::Io {
            message: error.to_string(),
            source: error,
        }
    }
}
