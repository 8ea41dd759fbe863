//! Error definitions for the MQTT session layer

use thiserror::Error;

/// Errors raised while resolving configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid TOML for [`crate::config::Settings`]
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Broker URL uses a scheme the transport cannot speak
    #[error("Unsupported broker URL scheme: {0}")]
    UnsupportedScheme(String),

    /// Broker URL has no host part
    #[error("Broker URL has no host: {0}")]
    MissingHost(String),

    /// Port could not be parsed or is zero
    #[error("Invalid broker port: {0}")]
    InvalidPort(String),

    /// Reconnect policy values are inconsistent
    #[error("Invalid reconnect policy: {0}")]
    InvalidPolicy(String),

    /// QoS level outside 0..=2
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),

    /// Keep-alive does not fit the 16-bit seconds field of CONNECT
    #[error("Invalid keep-alive: {0}s exceeds 65535s")]
    InvalidKeepAlive(u64),
}

/// Errors reported by a [`super::transport::Transport`] implementation
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The client library refused to queue the request
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The link is already closed
    #[error("Transport link closed")]
    Closed,

    /// Connection options could not be turned into a client
    #[error("Invalid connection options: {0}")]
    InvalidOptions(String),
}

/// Errors of the session manager itself
///
/// None of these ever escape the fire-and-forget operations of
/// [`super::session_handle::SessionManager`]; they are logged or turned into
/// notifications by the worker. They are returned from configuration loading
/// and from [`super::session_handle::SessionManager::shutdown`].
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Operation requires a live broker connection
    #[error("MQTT is not connected")]
    NotConnected,

    /// Topic filter failed validation
    #[error("Invalid topic filter '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: &'static str },

    /// The worker task has already stopped
    #[error("Session worker is gone")]
    WorkerGone,
}
