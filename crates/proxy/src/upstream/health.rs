//! Active backend health checking.
//!
//! One task per host probes on a fixed interval. A failed probe takes the
//! host out of its pool's balancer; a later successful probe puts it back.
//! Unreachable backends are routine and never stop the process.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::BackendPool;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Whether `address` (`host:port`) is reachable.
    async fn probe(&self, address: &str) -> bool;
}

/// TCP connect with a timeout.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    connect_timeout: Duration,
}

impl TcpProbe {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, address: &str) -> bool {
        match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                trace!(address = %address, error = %e, "Health probe failed");
                false
            }
            Err(_) => {
                trace!(address = %address, "Health probe timed out");
                false
            }
        }
    }
}

/// How a pool checks its hosts.
#[derive(Clone)]
pub struct HealthCheck {
    pub probe: Arc<dyn HealthProbe>,
    pub interval: Duration,
}

impl HealthCheck {
    pub fn new(probe: Arc<dyn HealthProbe>, interval: Duration) -> Self {
        Self { probe, interval }
    }

    pub fn tcp(interval: Duration, connect_timeout: Duration) -> Self {
        Self::new(Arc::new(TcpProbe::new(connect_timeout)), interval)
    }
}

impl std::fmt::Debug for HealthCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthCheck")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

/// Start the check loop for one host.
///
/// The loop holds only a weak reference to its pool and exits when the
/// pool is dropped or `token` is cancelled.
pub(crate) fn spawn_check(
    pool: Weak<BackendPool>,
    host: String,
    token: CancellationToken,
    check: HealthCheck,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let reachable = tokio::select! {
                _ = token.cancelled() => break,
                reachable = check.probe.probe(&host) => reachable,
            };

            let Some(pool) = pool.upgrade() else {
                break;
            };
            pool.record_probe(&host, reachable);
        }

        debug!(host = %host, "Health check stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_probe_reachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let probe = TcpProbe::new(Duration::from_millis(500));
        assert!(probe.probe(&address).await);
    }

    #[tokio::test]
    async fn test_tcp_probe_refused() {
        // bind then drop to get a port nothing listens on
        let address = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let probe = TcpProbe::new(Duration::from_millis(500));
        assert!(!probe.probe(&address).await);
    }
}
