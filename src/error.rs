//! Error types for the nullroute engine.

use std::io;

use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("resolver error: {0}")]
    Resolver(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Whether the orchestrator may tear the session down and try again.
    ///
    /// Only invalid configuration files and metrics setup failures are
    /// treated as permanent; everything observed while a session is running
    /// ends in a reconnect.
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(ConfigError::NoIpv4Subnet) => true,
            Self::Config(_) | Self::Metrics(_) => false,
            Self::Network(_) | Self::Resolver(_) | Self::Io(_) => true,
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadFile(#[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[source] toml::de::Error),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("failed to add any IPv4 documentation address to the tunnel interface")]
    NoIpv4Subnet,
}

/// Validation errors for configuration values.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("buffer_pool_size must be greater than 0")]
    ZeroBufferPoolSize,

    #[error("completion_channel_capacity must be greater than 0")]
    ZeroCompletionCapacity,

    #[error("cache_capacity must be greater than 0")]
    ZeroCacheCapacity,

    #[error("upstream.timeout_secs must be greater than 0")]
    ZeroUpstreamTimeout,

    #[error("upstream.url must start with https:// when DNS-over-HTTPS is enabled: {url:?}")]
    InvalidDohUrl { url: String },

    #[error("upstream.bootstrap cannot be empty when DNS-over-HTTPS is enabled")]
    EmptyBootstrap,

    #[error("host pattern cannot be empty")]
    EmptyHostPattern,

    #[error("invalid wildcard pattern: {pattern:?}")]
    InvalidWildcardPattern { pattern: String },

    #[error("redirect target for {host:?} cannot be empty")]
    EmptyRedirectTarget { host: String },
}

/// Network-related errors.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("tunnel interface closed")]
    TunnelClosed,

    #[error("failed to write to tunnel: {0}")]
    TunnelWrite(#[source] io::Error),

    #[error("failed to wait for tunnel events: {0}")]
    Poll(#[source] io::Error),

    #[error("cannot reach upstream DNS server: {0}")]
    Unreachable(#[source] io::Error),

    #[error("failed to send packet: {0}")]
    SendFailed(String),

    #[error("packet construction failed: {0}")]
    PacketConstruction(String),

    #[error("watchdog timed out waiting for {target}")]
    WatchdogTimeout { target: std::net::IpAddr },

    #[error("DNS-over-HTTPS request failed: {0}")]
    Doh(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;
