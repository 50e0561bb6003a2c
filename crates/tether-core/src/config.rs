//! Network configuration

use crate::error::{NetworkError, Result};
use std::time::Duration;

/// Top-level configuration for a [`Manager`](crate::Manager)
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Connection and request settings
    pub connection: ConnectionConfig,

    /// Replicated channel settings
    pub channel: ChannelConfig,

    /// Outgoing block pool settings
    pub pool: PoolConfig,

    /// Authentication policy for inbound connections
    pub auth: AuthenticationPolicy,

    /// Delay before a closed host's ID may be reused
    pub host_id_reuse_delay: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            channel: ChannelConfig::default(),
            pool: PoolConfig::default(),
            auth: AuthenticationPolicy::default(),
            host_id_reuse_delay: Duration::from_secs(10),
        }
    }
}

impl NetworkConfig {
    /// Check the configuration for values that would stall or spin the manager.
    ///
    /// # Errors
    ///
    /// Returns [`NetworkError::InvalidConfig`] describing the first bad value.
    pub fn validate(&self) -> Result<()> {
        if self.connection.request_timeout.is_zero() {
            return Err(NetworkError::InvalidConfig(
                "request_timeout must be non-zero".into(),
            ));
        }
        if self.connection.setup_timeout.is_zero() {
            return Err(NetworkError::InvalidConfig(
                "setup_timeout must be non-zero".into(),
            ));
        }
        if self.channel.resend_delay.is_zero() {
            return Err(NetworkError::InvalidConfig(
                "resend_delay must be non-zero".into(),
            ));
        }
        if self.channel.resend_interval.is_zero() {
            return Err(NetworkError::InvalidConfig(
                "resend_interval must be non-zero".into(),
            ));
        }
        if self.channel.resend_interval > self.channel.resend_delay {
            return Err(NetworkError::InvalidConfig(
                "resend_interval must not exceed resend_delay".into(),
            ));
        }
        if self.channel.max_received_channels == 0 {
            return Err(NetworkError::InvalidConfig(
                "max_received_channels must be non-zero".into(),
            ));
        }
        if self.connection.max_frame_size < 64 {
            return Err(NetworkError::InvalidConfig(
                "max_frame_size must be at least 64 bytes".into(),
            ));
        }
        if self.pool.block_capacity == 0 || self.pool.max_blocks == 0 {
            return Err(NetworkError::InvalidConfig(
                "block pool must have non-zero capacity".into(),
            ));
        }
        Ok(())
    }
}

/// Connection and request configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Default timeout for `request` when the caller supplies none
    pub request_timeout: Duration,

    /// Inbound connections that have not completed the handshake within
    /// this window are disconnected
    pub setup_timeout: Duration,

    /// Delay before a request ID may be reused
    pub request_id_reuse_delay: Duration,

    /// Delay before a connection ID may be reused
    pub connection_id_reuse_delay: Duration,

    /// Largest frame accepted from a peer
    pub max_frame_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            setup_timeout: Duration::from_secs(30),
            request_id_reuse_delay: Duration::from_secs(10),
            connection_id_reuse_delay: Duration::from_secs(10),
            max_frame_size: 1024 * 1024, // 1 MiB
        }
    }
}

/// Replicated channel configuration
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Minimum time between resends of an unacknowledged update
    pub resend_delay: Duration,

    /// Manager tick driving resends and the setup watchdog
    pub resend_interval: Duration,

    /// Delay before a channel ID may be reused
    pub channel_id_reuse_delay: Duration,

    /// Skip updates equal to the last value sent
    pub skip_unchanged_updates: bool,

    /// Channels a peer may have open on one connection at a time
    pub max_received_channels: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            resend_delay: Duration::from_millis(250),
            resend_interval: Duration::from_millis(50),
            channel_id_reuse_delay: Duration::from_secs(10),
            skip_unchanged_updates: true,
            max_received_channels: 256,
        }
    }
}

/// Block pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Initial capacity of each pooled buffer (one MTU-sized datagram)
    pub block_capacity: usize,

    /// Maximum number of idle buffers kept for reuse
    pub max_blocks: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            block_capacity: 1200,
            max_blocks: 256,
        }
    }
}

/// Authentication policy applied to inbound connections
#[derive(Debug, Clone, Default)]
pub struct AuthenticationPolicy {
    /// Reject `Connect` from peers that have not completed SRP authentication
    pub require_authentication: bool,

    /// Accept `Register` from unknown identifiers
    pub allow_registration: bool,
}
