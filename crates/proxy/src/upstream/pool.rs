use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use concord_config::{backend_address, parse_backend, Location};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::health::{spawn_check, HealthCheck};
use super::{DispatchError, UpstreamError};
use crate::balancer::{Balancer, BalancerRegistry};
use crate::limiter::{LimiterError, QpsLimiter, RateLimiter};
use crate::shutdown::InFlight;

struct HostEntry {
    target: Url,
    alive: bool,
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Snapshot of one host for read APIs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub host: String,
    pub target: String,
    pub alive: bool,
}

/// Read-only view of a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
    pub pattern: String,
    pub balance_mode: String,
    pub hosts: Vec<HostStatus>,
    pub methods: Vec<String>,
}

/// The backends behind one routed prefix.
///
/// Host keys are `host:port`. Every key in the host map carries its own
/// liveness flag; the balancer holds exactly the alive keys.
pub struct BackendPool {
    pattern: String,
    hosts: RwLock<BTreeMap<String, HostEntry>>,
    balancer: RwLock<Arc<dyn Balancer>>,
    limiters: DashMap<String, Arc<dyn RateLimiter>>,
    health: Option<HealthCheck>,
    shutdown: CancellationToken,
}

impl BackendPool {
    /// Build a pool from its location and start health checks when `health`
    /// is set. Every host starts alive.
    pub fn spawn(
        location: &Location,
        balancers: &BalancerRegistry,
        health: Option<HealthCheck>,
    ) -> Result<Arc<Self>, UpstreamError> {
        let mut hosts = BTreeMap::new();
        let mut order = Vec::with_capacity(location.proxy_pass.len());
        let shutdown = CancellationToken::new();

        for raw in &location.proxy_pass {
            let target = parse_backend(raw).map_err(UpstreamError::InvalidBackend)?;
            let key = backend_address(&target)
                .ok_or_else(|| UpstreamError::InvalidBackend(raw.clone()))?;
            if hosts.contains_key(&key) {
                continue;
            }
            trace!(pattern = %location.pattern, host = %key, "Registering backend");
            order.push(key.clone());
            hosts.insert(
                key,
                HostEntry {
                    target,
                    alive: true,
                    token: shutdown.child_token(),
                    task: None,
                },
            );
        }

        let balancer = balancers.build(&location.balance_mode, &order)?;

        let pool = Arc::new(Self {
            pattern: location.pattern.clone(),
            hosts: RwLock::new(hosts),
            balancer: RwLock::new(balancer),
            limiters: DashMap::new(),
            health,
            shutdown,
        });

        if let Some(check) = &pool.health {
            let mut hosts = pool.hosts.write();
            for (key, entry) in hosts.iter_mut() {
                entry.task = Some(spawn_check(
                    Arc::downgrade(&pool),
                    key.clone(),
                    entry.token.clone(),
                    check.clone(),
                ));
            }
        }

        debug!(
            pattern = %pool.pattern,
            hosts = order.len(),
            balance_mode = %location.balance_mode,
            health_checks = pool.health.is_some(),
            "Backend pool created"
        );
        Ok(pool)
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn balancer(&self) -> Arc<dyn Balancer> {
        self.balancer.read().clone()
    }

    pub fn balance_mode(&self) -> &'static str {
        self.balancer.read().mode()
    }

    pub fn contains_host(&self, host: &str) -> bool {
        self.hosts.read().contains_key(host)
    }

    pub fn is_alive(&self, host: &str) -> Option<bool> {
        self.hosts.read().get(host).map(|entry| entry.alive)
    }

    pub fn hosts(&self) -> Vec<HostStatus> {
        self.hosts
            .read()
            .iter()
            .map(|(host, entry)| HostStatus {
                host: host.clone(),
                target: entry.target.to_string(),
                alive: entry.alive,
            })
            .collect()
    }

    pub fn info(&self) -> PoolInfo {
        PoolInfo {
            pattern: self.pattern.clone(),
            balance_mode: self.balance_mode().to_string(),
            hosts: self.hosts(),
            methods: self.methods(),
        }
    }

    /// Apply one probe result, moving the host in or out of the balancer on
    /// a state change.
    pub fn record_probe(&self, host: &str, reachable: bool) {
        let mut hosts = self.hosts.write();
        let Some(entry) = hosts.get_mut(host) else {
            return;
        };

        match (entry.alive, reachable) {
            (true, false) => {
                entry.alive = false;
                self.balancer.read().remove(host);
                warn!(
                    pattern = %self.pattern,
                    host = %host,
                    "Backend unreachable, removed from load balancer"
                );
            }
            (false, true) => {
                entry.alive = true;
                self.balancer.read().add(host);
                info!(
                    pattern = %self.pattern,
                    host = %host,
                    "Backend reachable, added to load balancer"
                );
            }
            _ => {}
        }
    }

    /// Add a backend by URL. Returns its host key.
    ///
    /// Adding a host that is already present changes nothing.
    pub fn add_host(self: &Arc<Self>, raw: &str) -> Result<String, UpstreamError> {
        let target = parse_backend(raw).map_err(UpstreamError::InvalidBackend)?;
        let key = backend_address(&target)
            .ok_or_else(|| UpstreamError::InvalidBackend(raw.to_string()))?;

        let mut hosts = self.hosts.write();
        if hosts.contains_key(&key) {
            debug!(pattern = %self.pattern, host = %key, "Host already present");
            return Ok(key);
        }

        let token = self.shutdown.child_token();
        let task = self.health.as_ref().map(|check| {
            spawn_check(Arc::downgrade(self), key.clone(), token.clone(), check.clone())
        });
        hosts.insert(
            key.clone(),
            HostEntry {
                target,
                alive: true,
                token,
                task,
            },
        );
        self.balancer.read().add(&key);

        info!(pattern = %self.pattern, host = %key, "Host added");
        Ok(key)
    }

    /// Remove a host and stop its health check, waiting at most `wait` for
    /// the check loop to finish.
    ///
    /// The host leaves the pool even when the wait times out.
    pub async fn remove_host(&self, host: &str, wait: Duration) -> Result<(), UpstreamError> {
        let entry = {
            let mut hosts = self.hosts.write();
            let entry = hosts.remove(host).ok_or_else(|| UpstreamError::HostNotFound {
                pattern: self.pattern.clone(),
                host: host.to_string(),
            })?;
            self.balancer.read().remove(host);
            entry
        };

        entry.token.cancel();
        if let Some(task) = entry.task {
            let abort = task.abort_handle();
            if tokio::time::timeout(wait, task).await.is_err() {
                abort.abort();
                warn!(pattern = %self.pattern, host = %host, "Health check did not stop in time");
                return Err(UpstreamError::ShutdownTimeout(host.to_string()));
            }
        }

        info!(pattern = %self.pattern, host = %host, "Host removed");
        Ok(())
    }

    /// Swap the balancer for a fresh one of `mode` over the alive hosts.
    pub fn change_balancer(
        &self,
        mode: &str,
        balancers: &BalancerRegistry,
    ) -> Result<(), UpstreamError> {
        let hosts = self.hosts.read();
        let alive: Vec<String> = hosts
            .iter()
            .filter(|(_, entry)| entry.alive)
            .map(|(host, _)| host.clone())
            .collect();
        let balancer = balancers.build(mode, &alive)?;
        *self.balancer.write() = balancer;

        info!(pattern = %self.pattern, balance_mode = %mode, "Balancer changed");
        Ok(())
    }

    pub fn limiter(&self, path: &str) -> Option<Arc<dyn RateLimiter>> {
        self.limiters.get(path).map(|entry| entry.value().clone())
    }

    /// Install `limiter` for `path`, replacing whatever was there.
    pub fn install_limiter(&self, path: &str, limiter: Arc<dyn RateLimiter>) {
        self.limiters.insert(path.to_string(), limiter);
    }

    /// Install an unlimited QPS limiter for a path seen for the first time.
    pub fn provision_default_limiter(&self, path: &str) -> Result<(), LimiterError> {
        match self.limiters.entry(path.to_string()) {
            Entry::Occupied(_) => Err(LimiterError::AlreadyExists(path.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(QpsLimiter::new()));
                trace!(pattern = %self.pattern, path = %path, "Provisioned default limiter");
                Ok(())
            }
        }
    }

    /// Sub-paths with a limiter, sorted.
    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.limiters.iter().map(|e| e.key().clone()).collect();
        methods.sort();
        methods
    }

    /// Take a limiter permit for `path` and pick a host for `client`.
    pub async fn acquire(
        self: &Arc<Self>,
        path: &str,
        client: &str,
        in_flight: Option<InFlight>,
    ) -> Result<DispatchGuard, DispatchError> {
        let limiter = match self.limiter(path) {
            Some(limiter) => limiter,
            None => {
                match self.provision_default_limiter(path) {
                    Ok(()) | Err(LimiterError::AlreadyExists(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                self.limiter(path).ok_or_else(|| self.throttled(path))?
            }
        };

        let timeout = limiter.timeout();
        let permit = if timeout.is_zero() {
            limiter.take()
        } else {
            limiter.take_with_timeout(timeout).await
        };
        if permit.is_err() {
            debug!(pattern = %self.pattern, path = %path, "Request throttled");
            return Err(self.throttled(path));
        }

        let balancer = self.balancer();
        let chosen = balancer
            .balance(client)
            .ok()
            .and_then(|host| {
                let target = self.hosts.read().get(&host)?.target.clone();
                Some((host, target))
            });
        let Some((host, target)) = chosen else {
            limiter.release();
            return Err(DispatchError::NoHost(self.pattern.clone()));
        };

        balancer.inc(&host);
        Ok(DispatchGuard {
            pool: self.clone(),
            balancer,
            limiter,
            host,
            target,
            path: path.to_string(),
            _in_flight: in_flight,
        })
    }

    fn throttled(&self, path: &str) -> DispatchError {
        DispatchError::Throttled {
            pattern: self.pattern.clone(),
            path: path.to_string(),
        }
    }

    /// Stop every health check loop of this pool.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            debug!(pattern = %self.pattern, "Shutting down backend pool");
            self.shutdown.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for BackendPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendPool")
            .field("pattern", &self.pattern)
            .field("balance_mode", &self.balance_mode())
            .field("hosts", &self.hosts.read().len())
            .finish()
    }
}

/// A host chosen for one request.
///
/// Dropping the guard reports completion to the balancer and returns the
/// limiter permit.
pub struct DispatchGuard {
    pool: Arc<BackendPool>,
    balancer: Arc<dyn Balancer>,
    limiter: Arc<dyn RateLimiter>,
    host: String,
    target: Url,
    path: String,
    _in_flight: Option<InFlight>,
}

impl DispatchGuard {
    pub fn pattern(&self) -> &str {
        self.pool.pattern()
    }

    /// Host key, `host:port`.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Request path relative to the pool prefix.
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        self.balancer.done(&self.host);
        self.limiter.release();
    }
}

impl std::fmt::Debug for DispatchGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchGuard")
            .field("pattern", &self.pool.pattern())
            .field("host", &self.host)
            .field("path", &self.path)
            .finish()
    }
}
