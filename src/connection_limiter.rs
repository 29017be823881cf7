use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

/// Error when an admission limit is reached
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("maximum total connections reached ({0})")]
    TotalLimitReached(usize),
    #[error("maximum connections per IP reached ({0})")]
    IpLimitReached(usize),
}

/// Admission control applied before the handshake. A limit of 0 disables it.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    max_total: usize,
    max_per_ip: usize,
    inner: Arc<Mutex<LiveConnections>>,
}

#[derive(Debug, Default)]
struct LiveConnections {
    per_ip: HashMap<IpAddr, usize>,
    total: usize,
}

impl ConnectionLimiter {
    pub fn new(max_total: usize, max_per_ip: usize) -> Self {
        Self {
            max_total,
            max_per_ip,
            inner: Arc::new(Mutex::new(LiveConnections::default())),
        }
    }

    /// Reserve a slot for `ip`. Every `Ok` must be paired with [`Self::disconnect`].
    pub async fn try_connect(&self, ip: IpAddr) -> Result<(), LimitError> {
        let mut live = self.inner.lock().await;

        if self.max_total > 0 && live.total >= self.max_total {
            debug!("Refusing {}: {} connections already live", ip, live.total);
            return Err(LimitError::TotalLimitReached(self.max_total));
        }

        let ip_count = live.per_ip.get(&ip).copied().unwrap_or(0);
        if self.max_per_ip > 0 && ip_count >= self.max_per_ip {
            debug!("Refusing {}: {} connections already open from it", ip, ip_count);
            return Err(LimitError::IpLimitReached(self.max_per_ip));
        }

        live.total += 1;
        *live.per_ip.entry(ip).or_insert(0) += 1;
        Ok(())
    }

    /// Release the slot taken by a finished connection
    pub async fn disconnect(&self, ip: IpAddr) {
        let mut live = self.inner.lock().await;

        live.total = live.total.saturating_sub(1);
        if let Some(count) = live.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                live.per_ip.remove(&ip);
            }
        }
    }

    /// (live connections, distinct remote IPs)
    pub async fn stats(&self) -> (usize, usize) {
        let live = self.inner.lock().await;
        (live.total, live.per_ip.len())
    }
}
