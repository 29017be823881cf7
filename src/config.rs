use std::time::Duration;

use clap::Parser;
use governor::Quota;
use thiserror::Error;

use crate::rate_limiter;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("rate limit needs a non-zero interval and burst")]
    InvalidQuota,
    #[error("outbound queue depth must be at least 1")]
    EmptyOutboundQueue,
    #[error("write timeout must be non-zero")]
    ZeroWriteTimeout,
    #[error("handshake timeout must be non-zero")]
    ZeroHandshakeTimeout,
}

/// Broadcast chat hub
#[derive(Debug, Clone, Parser)]
#[command(name = "chathub", version, about)]
pub struct Config {
    /// Address the chat listener binds to
    #[arg(long, default_value = "0.0.0.0:8081")]
    pub listen: String,

    /// Milliseconds between inbound message tokens per connection
    #[arg(long, default_value_t = 100)]
    pub rate_interval_ms: u64,

    /// Inbound messages a connection may send in one burst
    #[arg(long, default_value_t = 10)]
    pub burst: u32,

    /// Seconds a new socket gets to complete the WebSocket upgrade
    #[arg(long, default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// Ceiling on one wait for an inbound message
    #[arg(long, default_value_t = 6 * 60 * 60)]
    pub session_deadline_secs: u64,

    /// Bound on a single outbound frame write
    #[arg(long, default_value_t = 5000)]
    pub write_timeout_ms: u64,

    /// Frames queued per connection before broadcasts to it are dropped
    #[arg(long, default_value_t = 64)]
    pub outbound_queue: usize,

    /// Seconds in-flight sessions get to finish on shutdown
    #[arg(long, default_value_t = 10)]
    pub shutdown_grace_secs: u64,

    /// Maximum live connections, 0 for unlimited
    #[arg(long, default_value_t = 1000)]
    pub max_connections: usize,

    /// Maximum live connections per remote IP, 0 for unlimited
    #[arg(long, default_value_t = 0)]
    pub max_per_ip: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::parse_from(["chathub"])
    }
}

impl Config {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Validate the per-session knobs and resolve them into runtime values
    pub fn session_settings(&self) -> Result<SessionSettings, ConfigError> {
        let message_quota =
            rate_limiter::quota(Duration::from_millis(self.rate_interval_ms), self.burst)
                .ok_or(ConfigError::InvalidQuota)?;
        if self.outbound_queue == 0 {
            return Err(ConfigError::EmptyOutboundQueue);
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::ZeroWriteTimeout);
        }
        if self.handshake_timeout_secs == 0 {
            return Err(ConfigError::ZeroHandshakeTimeout);
        }
        Ok(SessionSettings {
            message_quota,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            session_deadline: Duration::from_secs(self.session_deadline_secs),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
            outbound_queue: self.outbound_queue,
        })
    }
}

/// Values every session is started with
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub message_quota: Quota,
    pub handshake_timeout: Duration,
    pub session_deadline: Duration,
    pub write_timeout: Duration,
    pub outbound_queue: usize,
}
