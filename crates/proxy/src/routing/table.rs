use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use concord_config::location::check_pattern;
use concord_config::{backend_address, parse_backend, Location};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::router::{PrefixRouter, DEFAULT_ROUTER};
use super::{LimiterInfo, RoutingError};
use crate::acl::{AccessControlList, AclRules};
use crate::balancer::BalancerRegistry;
use crate::limiter::{LimiterRegistry, RateLimiter};
use crate::metrics::{outcome, ProxyMetrics};
use crate::shutdown::ShutdownCoordinator;
use crate::upstream::{
    BackendPool, DispatchError, DispatchGuard, HealthCheck, PoolInfo, UpstreamError,
};

/// Serializable part of the table.
///
/// Live pools, balancers and limiters are rebuilt from this on restore.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub router_type: String,
    pub locations: BTreeMap<String, Location>,
    pub limiters: BTreeMap<String, Vec<LimiterInfo>>,
}

/// Live settings of one installed limiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimiterStatus {
    pub pattern: String,
    pub path: String,
    pub kind: String,
    pub volume: i64,
    pub speed: i64,
    pub timeout_ms: u64,
}

#[derive(Default)]
struct TableState {
    router: PrefixRouter<Arc<BackendPool>>,
    locations: BTreeMap<String, Location>,
    limiters: BTreeMap<String, Vec<LimiterInfo>>,
}

/// All pools of a node.
///
/// Structural changes (pool add and remove) take the table write lock; the
/// router, the location map and the limiter-config map change together so
/// the router's prefix set always equals the location map's key set.
pub struct RoutingTable {
    state: RwLock<TableState>,
    acl: Arc<AccessControlList>,
    balancers: BalancerRegistry,
    limiters: LimiterRegistry,
    health: Option<HealthCheck>,
    host_shutdown_timeout: Duration,
    metrics: Arc<ProxyMetrics>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl RoutingTable {
    pub fn new(
        acl: Arc<AccessControlList>,
        balancers: BalancerRegistry,
        limiters: LimiterRegistry,
        metrics: Arc<ProxyMetrics>,
    ) -> Self {
        Self {
            state: RwLock::new(TableState::default()),
            acl,
            balancers,
            limiters,
            health: None,
            host_shutdown_timeout: Duration::from_secs(5),
            metrics,
            shutdown: Arc::new(ShutdownCoordinator::default()),
        }
    }

    pub fn with_health_check(mut self, health: HealthCheck) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_host_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.host_shutdown_timeout = timeout;
        self
    }

    pub fn with_shutdown(mut self, shutdown: Arc<ShutdownCoordinator>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn acl(&self) -> &Arc<AccessControlList> {
        &self.acl
    }

    pub fn balancers(&self) -> &BalancerRegistry {
        &self.balancers
    }

    pub fn limiter_registry(&self) -> &LimiterRegistry {
        &self.limiters
    }

    pub fn metrics(&self) -> &Arc<ProxyMetrics> {
        &self.metrics
    }

    pub fn shutdown_coordinator(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    // ========================================================================
    // Pools
    // ========================================================================

    /// Build and register a pool.
    ///
    /// Returns `false` without touching anything when the pattern is already
    /// registered.
    pub fn add_pool_from_config(&self, location: &Location) -> Result<bool, RoutingError> {
        let mut state = self.state.write();
        let added = self.insert_pool(&mut state, location)?;
        if added {
            self.metrics.set_pools(state.router.len());
        }
        Ok(added)
    }

    fn insert_pool(
        &self,
        state: &mut TableState,
        location: &Location,
    ) -> Result<bool, RoutingError> {
        check_pattern(&location.pattern).map_err(RoutingError::InvalidPattern)?;
        if location.proxy_pass.is_empty() {
            return Err(RoutingError::InvalidPattern(format!(
                "location '{}' has no proxy hosts",
                location.pattern
            )));
        }

        if state.router.contains(&location.pattern) {
            debug!(pattern = %location.pattern, "Pool already registered");
            return Ok(false);
        }

        let pool = BackendPool::spawn(location, &self.balancers, self.health.clone())?;
        state.router.insert(&location.pattern, pool);
        state
            .locations
            .insert(location.pattern.clone(), location.clone());

        info!(
            pattern = %location.pattern,
            hosts = location.proxy_pass.len(),
            balance_mode = %location.balance_mode,
            "Pool registered"
        );
        Ok(true)
    }

    /// Shut a pool down and unregister it.
    pub fn remove_proxy(&self, pattern: &str) -> Result<(), RoutingError> {
        let pool = {
            let mut state = self.state.write();
            let pool = state
                .router
                .remove(pattern)
                .ok_or_else(|| RoutingError::PoolNotFound(pattern.to_string()))?;
            state.locations.remove(pattern);
            state.limiters.remove(pattern);
            self.metrics.set_pools(state.router.len());
            pool
        };

        pool.shutdown();
        info!(pattern = %pattern, "Pool removed");
        Ok(())
    }

    pub fn pool(&self, pattern: &str) -> Option<Arc<BackendPool>> {
        self.state.read().router.get(pattern).cloned()
    }

    fn require_pool(&self, pattern: &str) -> Result<Arc<BackendPool>, RoutingError> {
        self.pool(pattern)
            .ok_or_else(|| RoutingError::PoolNotFound(pattern.to_string()))
    }

    /// Add a backend URL to a pool. Returns the host key.
    pub fn add_host(&self, pattern: &str, host: &str) -> Result<String, RoutingError> {
        let mut state = self.state.write();
        let pool = state
            .router
            .get(pattern)
            .cloned()
            .ok_or_else(|| RoutingError::PoolNotFound(pattern.to_string()))?;

        let key = pool.add_host(host)?;
        if let Some(location) = state.locations.get_mut(pattern) {
            let known = location
                .proxy_pass
                .iter()
                .any(|raw| host_key(raw).as_deref() == Some(key.as_str()));
            if !known {
                location.proxy_pass.push(host.to_string());
            }
        }
        Ok(key)
    }

    /// Remove a backend from a pool. `host` may be a URL or a `host:port` key.
    pub async fn remove_host(&self, pattern: &str, host: &str) -> Result<(), RoutingError> {
        let key = host_key(host).unwrap_or_else(|| host.to_string());

        let pool = {
            let mut state = self.state.write();
            let pool = state
                .router
                .get(pattern)
                .cloned()
                .ok_or_else(|| RoutingError::PoolNotFound(pattern.to_string()))?;
            if !pool.contains_host(&key) {
                return Err(UpstreamError::HostNotFound {
                    pattern: pattern.to_string(),
                    host: key,
                }
                .into());
            }
            if let Some(location) = state.locations.get_mut(pattern) {
                location
                    .proxy_pass
                    .retain(|raw| host_key(raw).as_deref() != Some(key.as_str()));
            }
            pool
        };

        pool.remove_host(&key, self.host_shutdown_timeout).await?;
        Ok(())
    }

    /// Rebuild a pool's balancer as `mode` over its alive hosts.
    pub fn change_balancer(&self, pattern: &str, mode: &str) -> Result<(), RoutingError> {
        let mut state = self.state.write();
        let pool = state
            .router
            .get(pattern)
            .cloned()
            .ok_or_else(|| RoutingError::PoolNotFound(pattern.to_string()))?;
        pool.change_balancer(mode, &self.balancers)?;
        if let Some(location) = state.locations.get_mut(pattern) {
            location.balance_mode = mode.to_string();
        }
        Ok(())
    }

    // ========================================================================
    // Limiters
    // ========================================================================

    /// Install a limiter on a pool's sub-path and record its configuration.
    ///
    /// A later configuration for the same sub-path replaces the earlier one.
    pub fn set_rate_limiter(&self, info: &LimiterInfo) -> Result<(), RoutingError> {
        let mut state = self.state.write();
        self.insert_limiter(&mut state, info)
    }

    fn insert_limiter(
        &self,
        state: &mut TableState,
        info: &LimiterInfo,
    ) -> Result<(), RoutingError> {
        let pool = state
            .router
            .get(&info.prefix)
            .cloned()
            .ok_or_else(|| RoutingError::PoolNotFound(info.prefix.clone()))?;

        let limiter = self.build_limiter(info)?;
        pool.install_limiter(&info.path_name, limiter);

        let configs = state.limiters.entry(info.prefix.clone()).or_default();
        configs.retain(|existing| existing.path_name != info.path_name);
        configs.push(info.clone());

        debug!(
            pattern = %info.prefix,
            path = %info.path_name,
            limiter_type = %info.limiter_type,
            volume = info.volume,
            speed = info.speed,
            duration_ms = info.duration,
            "Rate limiter installed"
        );
        Ok(())
    }

    fn build_limiter(&self, info: &LimiterInfo) -> Result<Arc<dyn RateLimiter>, RoutingError> {
        let limiter = self.limiters.build(&info.limiter_type)?;
        if info.speed != 0 || info.volume != 0 {
            limiter.set_rate(info.volume, info.speed);
        }
        if info.duration != 0 {
            limiter.set_timeout(Duration::from_millis(info.duration));
        }
        Ok(limiter)
    }

    /// Live settings of the limiter on `pattern` + `path`.
    pub fn limiter_info(&self, pattern: &str, path: &str) -> Result<LimiterStatus, RoutingError> {
        let pool = self.require_pool(pattern)?;
        let limiter = pool
            .limiter(path)
            .ok_or_else(|| RoutingError::LimiterNotFound {
                pattern: pattern.to_string(),
                path: path.to_string(),
            })?;
        Ok(LimiterStatus {
            pattern: pattern.to_string(),
            path: path.to_string(),
            kind: limiter.kind().to_string(),
            volume: limiter.volume(),
            speed: limiter.speed(),
            timeout_ms: limiter.timeout().as_millis() as u64,
        })
    }

    /// Sub-paths of a pool that have a limiter.
    pub fn methods(&self, pattern: &str) -> Result<Vec<String>, RoutingError> {
        Ok(self.require_pool(pattern)?.methods())
    }

    /// Replicated limiter configurations of a pool.
    pub fn limiter_configs(&self, pattern: &str) -> Vec<LimiterInfo> {
        self.state
            .read()
            .limiters
            .get(pattern)
            .cloned()
            .unwrap_or_default()
    }

    // ========================================================================
    // Request path
    // ========================================================================

    /// Longest-prefix lookup. Returns the pool and the pool-relative path.
    pub fn route(&self, path: &str) -> Option<(Arc<BackendPool>, String)> {
        let state = self.state.read();
        state
            .router
            .route(path)
            .map(|m| (m.target.clone(), m.path))
    }

    /// Route `path` and admit `client` under one table read lock.
    ///
    /// A restore swaps routes and ACL under the write lock, so the pool and
    /// the ACL verdict always come from the same state.
    pub fn resolve(
        &self,
        path: &str,
        client: IpAddr,
    ) -> Result<(Arc<BackendPool>, String), DispatchError> {
        let state = self.state.read();
        let matched = state
            .router
            .route(path)
            .ok_or_else(|| DispatchError::NoRoute(path.to_string()))?;
        self.admit(matched.target, client)?;
        Ok((matched.target.clone(), matched.path))
    }

    /// Route `path` and dispatch it for `client`.
    pub async fn dispatch(
        &self,
        path: &str,
        client: IpAddr,
    ) -> Result<DispatchGuard, DispatchError> {
        let result = match self.resolve(path, client) {
            Ok((pool, rewritten)) => self.take(&pool, &rewritten, client).await,
            Err(e) => Err(e),
        };
        self.record(&result);
        result
    }

    /// Dispatch a pool-relative `path` on an already routed pool.
    pub async fn dispatch_to(
        &self,
        pool: &Arc<BackendPool>,
        path: &str,
        client: IpAddr,
    ) -> Result<DispatchGuard, DispatchError> {
        let result = match self.admit(pool, client) {
            Ok(()) => self.take(pool, path, client).await,
            Err(e) => Err(e),
        };
        self.record(&result);
        result
    }

    fn admit(&self, pool: &BackendPool, client: IpAddr) -> Result<(), DispatchError> {
        if self.shutdown.is_shutdown_requested() {
            return Err(DispatchError::ShuttingDown);
        }
        if self.acl.is_denied(client) {
            debug!(client = %client, pattern = %pool.pattern(), "Client denied");
            return Err(DispatchError::Denied(client));
        }
        Ok(())
    }

    async fn take(
        &self,
        pool: &Arc<BackendPool>,
        path: &str,
        client: IpAddr,
    ) -> Result<DispatchGuard, DispatchError> {
        pool.acquire(path, &client.to_string(), Some(self.shutdown.track()))
            .await
    }

    fn record(&self, result: &Result<DispatchGuard, DispatchError>) {
        match result {
            Ok(_) => self.metrics.record_dispatch(outcome::ROUTED),
            Err(e) => self.metrics.record_dispatch(e.outcome()),
        }
    }

    // ========================================================================
    // Snapshot / restore
    // ========================================================================

    pub fn snapshot(&self) -> RoutingSnapshot {
        let state = self.state.read();
        RoutingSnapshot {
            router_type: state.router.kind().to_string(),
            locations: state.locations.clone(),
            limiters: state.limiters.clone(),
        }
    }

    /// Replace every pool with ones rebuilt from `snapshot`.
    ///
    /// Entries that fail to rebuild are logged and skipped, the same way on
    /// every replica.
    pub fn restore(&self, snapshot: &RoutingSnapshot) {
        let next = self.build_state(snapshot);
        self.install_state(next, None);
    }

    /// Like [`restore`](Self::restore), also swapping in `rules` as the ACL
    /// under the same write lock.
    pub fn restore_with_acl(&self, snapshot: &RoutingSnapshot, rules: AclRules) {
        let next = self.build_state(snapshot);
        self.install_state(next, Some(rules));
    }

    /// Build the full table for `snapshot` without touching the live one.
    fn build_state(&self, snapshot: &RoutingSnapshot) -> TableState {
        if !snapshot.router_type.is_empty() && snapshot.router_type != DEFAULT_ROUTER {
            debug!(router_type = %snapshot.router_type, "Unknown router type, using default");
        }

        let mut next = TableState::default();
        for location in snapshot.locations.values() {
            if let Err(e) = self.insert_pool(&mut next, location) {
                error!(pattern = %location.pattern, error = %e, "Failed to rebuild pool");
            }
        }

        for (pattern, configs) in &snapshot.limiters {
            for info in configs {
                if info.prefix != *pattern {
                    continue;
                }
                if let Err(e) = self.insert_limiter(&mut next, info) {
                    error!(
                        pattern = %pattern,
                        path = %info.path_name,
                        error = %e,
                        "Failed to reinstall rate limiter"
                    );
                }
            }
        }
        next
    }

    /// Swap `next` in, then stop the pools it replaced. Requests already
    /// holding an old pool finish on it.
    fn install_state(&self, next: TableState, rules: Option<AclRules>) {
        let pools = next.router.len();
        let mut previous = {
            let mut state = self.state.write();
            if let Some(rules) = rules {
                self.acl.install(rules);
            }
            std::mem::replace(&mut *state, next)
        };
        self.metrics.set_pools(pools);

        for (_, pool) in previous.router.drain() {
            pool.shutdown();
        }
        info!(pools, "Routing table restored");
    }

    /// Unregister and stop every pool.
    pub fn shutdown_pools(&self) {
        let pools: Vec<Arc<BackendPool>> = {
            let mut state = self.state.write();
            state.locations.clear();
            state.limiters.clear();
            state.router.drain().map(|(_, pool)| pool).collect()
        };
        for pool in &pools {
            pool.shutdown();
        }
        self.metrics.set_pools(0);
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn patterns(&self) -> Vec<String> {
        self.state.read().router.patterns()
    }

    pub fn len(&self) -> usize {
        self.state.read().router.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn location(&self, pattern: &str) -> Option<Location> {
        self.state.read().locations.get(pattern).cloned()
    }

    pub fn pools(&self) -> Vec<PoolInfo> {
        let pools: Vec<Arc<BackendPool>> = {
            let state = self.state.read();
            state
                .router
                .patterns()
                .iter()
                .filter_map(|p| state.router.get(p).cloned())
                .collect()
        };
        pools.iter().map(|pool| pool.info()).collect()
    }

    pub fn balancer_modes(&self) -> Vec<String> {
        self.balancers.names()
    }

    pub fn limiter_types(&self) -> Vec<String> {
        self.limiters.names()
    }
}

impl std::fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingTable")
            .field("patterns", &self.patterns())
            .finish_non_exhaustive()
    }
}

fn host_key(raw: &str) -> Option<String> {
    parse_backend(raw).ok().and_then(|url| backend_address(&url))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{BalancerSettings, CONSISTENT_HASH, ROUND_ROBIN};
    use crate::limiter::{CONCURRENCY, QPS};
    use crate::upstream::DispatchError;

    fn table() -> RoutingTable {
        RoutingTable::new(
            Arc::new(AccessControlList::new()),
            BalancerRegistry::with_defaults(BalancerSettings::default()),
            LimiterRegistry::with_defaults(),
            Arc::new(ProxyMetrics::new().unwrap()),
        )
    }

    fn location(pattern: &str, hosts: &[&str]) -> Location {
        Location::new(
            pattern,
            hosts.iter().map(|h| h.to_string()).collect(),
            ROUND_ROBIN,
        )
    }

    fn client(ip: &str) -> IpAddr {
        ip.parse().unwrap()
    }

    #[test]
    fn test_add_pool_is_idempotent() {
        let table = table();
        let loc = location("/api", &["http://127.0.0.1:8000"]);
        assert!(table.add_pool_from_config(&loc).unwrap());
        let before = table.snapshot();

        assert!(!table.add_pool_from_config(&loc).unwrap());
        assert_eq!(table.snapshot(), before);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_add_pool_validation() {
        let table = table();
        let err = table
            .add_pool_from_config(&location("api", &["http://127.0.0.1:8000"]))
            .unwrap_err();
        assert!(matches!(err, RoutingError::InvalidPattern(_)));

        let err = table.add_pool_from_config(&location("/api", &[])).unwrap_err();
        assert!(matches!(err, RoutingError::InvalidPattern(_)));
        assert!(table.is_empty());
    }

    #[test]
    fn test_route_longest_prefix() {
        let table = table();
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();
        table
            .add_pool_from_config(&location("/api/v2", &["http://127.0.0.1:8001"]))
            .unwrap();

        let (pool, path) = table.route("/api/v2/users").unwrap();
        assert_eq!(pool.pattern(), "/api/v2");
        assert_eq!(path, "/users");

        let (pool, path) = table.route("/api/other").unwrap();
        assert_eq!(pool.pattern(), "/api");
        assert_eq!(path, "/other");

        assert!(table.route("/nothing").is_none());
    }

    #[tokio::test]
    async fn test_dispatch_denied_by_acl() {
        let table = table();
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();
        table.acl().add("10.0.0.0/24", "10.0.0.0/24").unwrap();

        let err = table.dispatch("/api/x", client("10.0.0.5")).await.unwrap_err();
        assert_eq!(err, DispatchError::Denied(client("10.0.0.5")));
        assert_eq!(table.metrics().dispatch_count(outcome::DENIED), 1);

        let guard = table.dispatch("/api/x", client("10.0.1.5")).await.unwrap();
        assert_eq!(guard.host(), "127.0.0.1:8000");
        assert_eq!(guard.path(), "/x");
        assert_eq!(guard.pattern(), "/api");
    }

    #[tokio::test]
    async fn test_dispatch_no_route() {
        let table = table();
        let err = table.dispatch("/missing", client("1.1.1.1")).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoRoute(_)));
        assert_eq!(table.metrics().dispatch_count(outcome::NOT_FOUND), 1);
    }

    #[tokio::test]
    async fn test_dispatch_throttled() {
        let table = table();
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();
        table
            .set_rate_limiter(&LimiterInfo::new("/api", "/users", QPS).with_rate(2, 1))
            .unwrap();

        let c = client("192.168.0.1");
        let _a = table.dispatch("/api/users", c).await.unwrap();
        let _b = table.dispatch("/api/users", c).await.unwrap();
        let err = table.dispatch("/api/users", c).await.unwrap_err();
        assert!(matches!(err, DispatchError::Throttled { .. }));
        assert_eq!(table.metrics().dispatch_count(outcome::THROTTLED), 1);

        // other sub-paths are unaffected
        assert!(table.dispatch("/api/orders", c).await.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_tracks_in_flight() {
        let table = table();
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();

        let guard = table.dispatch("/api/x", client("1.1.1.1")).await.unwrap();
        assert_eq!(table.shutdown_coordinator().in_flight(), 1);
        drop(guard);
        assert_eq!(table.shutdown_coordinator().in_flight(), 0);

        table.shutdown_coordinator().request_shutdown();
        let err = table.dispatch("/api/x", client("1.1.1.1")).await.unwrap_err();
        assert_eq!(err, DispatchError::ShuttingDown);
    }

    #[test]
    fn test_set_rate_limiter_replaces_config() {
        let table = table();
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();

        table
            .set_rate_limiter(&LimiterInfo::new("/api", "/users", QPS).with_rate(10, 5))
            .unwrap();
        table
            .set_rate_limiter(
                &LimiterInfo::new("/api", "/users", CONCURRENCY)
                    .with_rate(3, 0)
                    .with_duration_ms(100),
            )
            .unwrap();

        let configs = table.limiter_configs("/api");
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].limiter_type, CONCURRENCY);

        let status = table.limiter_info("/api", "/users").unwrap();
        assert_eq!(status.kind, CONCURRENCY);
        assert_eq!(status.volume, 3);
        assert_eq!(status.timeout_ms, 100);
        assert_eq!(table.methods("/api").unwrap(), vec!["/users".to_string()]);
    }

    #[test]
    fn test_set_rate_limiter_errors() {
        let table = table();
        let err = table
            .set_rate_limiter(&LimiterInfo::new("/none", "/", QPS))
            .unwrap_err();
        assert_eq!(err, RoutingError::PoolNotFound("/none".into()));

        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();
        let err = table
            .set_rate_limiter(&LimiterInfo::new("/api", "/", "token-ring"))
            .unwrap_err();
        assert!(matches!(err, RoutingError::Limiter(_)));
        assert!(table.limiter_configs("/api").is_empty());
    }

    #[tokio::test]
    async fn test_host_changes_reach_location() {
        let table = table();
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();

        let key = table.add_host("/api", "http://127.0.0.1:8001").unwrap();
        assert_eq!(key, "127.0.0.1:8001");
        assert_eq!(table.location("/api").unwrap().proxy_pass.len(), 2);

        table.remove_host("/api", "http://127.0.0.1:8000").await.unwrap();
        let location = table.location("/api").unwrap();
        assert_eq!(location.proxy_pass, vec!["http://127.0.0.1:8001".to_string()]);

        let err = table.remove_host("/api", "127.0.0.1:8000").await.unwrap_err();
        assert!(matches!(err, RoutingError::Upstream(UpstreamError::HostNotFound { .. })));
    }

    #[test]
    fn test_remove_proxy() {
        let table = table();
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();
        let pool = table.pool("/api").unwrap();
        table
            .set_rate_limiter(&LimiterInfo::new("/api", "/u", QPS).with_rate(1, 1))
            .unwrap();

        table.remove_proxy("/api").unwrap();
        assert!(pool.is_shut_down());
        assert!(table.route("/api/u").is_none());
        assert!(table.snapshot().limiters.is_empty());
        assert_eq!(
            table.remove_proxy("/api"),
            Err(RoutingError::PoolNotFound("/api".into()))
        );
    }

    #[test]
    fn test_change_balancer() {
        let table = table();
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();
        table.change_balancer("/api", CONSISTENT_HASH).unwrap();
        assert_eq!(table.pool("/api").unwrap().balance_mode(), CONSISTENT_HASH);
        assert_eq!(table.location("/api").unwrap().balance_mode, CONSISTENT_HASH);

        let err = table.change_balancer("/api", "random").unwrap_err();
        assert!(matches!(err, RoutingError::Upstream(_)));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let source = table();
        source
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();
        source
            .add_pool_from_config(&location("/static", &["http://127.0.0.1:9000"]))
            .unwrap();
        source
            .set_rate_limiter(&LimiterInfo::new("/api", "/users", QPS).with_rate(5, 2))
            .unwrap();
        let snapshot = source.snapshot();

        let replica = table();
        replica
            .add_pool_from_config(&location("/stale", &["http://127.0.0.1:1"]))
            .unwrap();
        replica.restore(&snapshot);

        assert_eq!(replica.snapshot(), snapshot);
        assert_eq!(replica.patterns(), vec!["/api".to_string(), "/static".to_string()]);
        let status = replica.limiter_info("/api", "/users").unwrap();
        assert_eq!(status.volume, 5);
        assert_eq!(status.speed, 2);

        // restoring twice gives the same state
        replica.restore(&snapshot);
        assert_eq!(replica.snapshot(), snapshot);
    }

    #[test]
    fn test_route_during_restore_never_misses() {
        let table = Arc::new(table());
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();
        table
            .set_rate_limiter(&LimiterInfo::new("/api", "/x", QPS).with_rate(100, 100))
            .unwrap();
        let snapshot = table.snapshot();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let table = table.clone();
            let stop = stop.clone();
            std::thread::spawn(move || {
                let (mut routes, mut misses) = (0usize, 0usize);
                loop {
                    match table.route("/api/x") {
                        Some(_) => routes += 1,
                        None => misses += 1,
                    }
                    if stop.load(std::sync::atomic::Ordering::Acquire) {
                        break (routes, misses);
                    }
                }
            })
        };

        for _ in 0..2000 {
            table.restore(&snapshot);
        }
        stop.store(true, std::sync::atomic::Ordering::Release);

        let (routes, misses) = reader.join().unwrap();
        assert!(routes > 0);
        assert_eq!(misses, 0);
        assert_eq!(table.snapshot(), snapshot);
        assert_eq!(table.limiter_info("/api", "/x").unwrap().volume, 100);
    }

    #[test]
    fn test_restore_stops_replaced_pools() {
        let table = table();
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();
        let old = table.pool("/api").unwrap();

        table.restore(&table.snapshot());
        let new = table.pool("/api").unwrap();
        assert!(old.is_shut_down());
        assert!(!new.is_shut_down());
        assert!(!Arc::ptr_eq(&old, &new));
    }

    #[test]
    fn test_restore_with_acl_installs_rules() {
        let table = table();
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();
        let rules = AclRules::build(&["10.0.0.0/8".to_string()]).unwrap();

        table.restore_with_acl(&table.snapshot(), rules);
        let err = table.resolve("/api/x", client("10.1.2.3")).unwrap_err();
        assert_eq!(err, DispatchError::Denied(client("10.1.2.3")));
        let (pool, path) = table.resolve("/api/x", client("11.1.2.3")).unwrap();
        assert_eq!(pool.pattern(), "/api");
        assert_eq!(path, "/x");
    }

    #[tokio::test]
    async fn test_lazy_limiters_are_not_replicated() {
        let table = table();
        table
            .add_pool_from_config(&location("/api", &["http://127.0.0.1:8000"]))
            .unwrap();
        let before = table.snapshot();

        let _guard = table.dispatch("/api/anything", client("1.2.3.4")).await.unwrap();
        assert_eq!(table.methods("/api").unwrap(), vec!["/anything".to_string()]);
        assert_eq!(table.snapshot(), before);
    }
}
