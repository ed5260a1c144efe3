//! Prometheus metrics for the control plane and dispatch path.
//!
//! Each node owns its registry; nothing is registered globally.

use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Outcome label values for `concord_dispatch_total`.
pub mod outcome {
    pub const ROUTED: &str = "routed";
    pub const DENIED: &str = "denied";
    pub const THROTTLED: &str = "throttled";
    pub const NO_HOST: &str = "no_host";
    pub const NOT_FOUND: &str = "not_found";
    pub const SHUTTING_DOWN: &str = "shutting_down";
}

pub struct ProxyMetrics {
    registry: Registry,
    applied: IntCounterVec,
    apply_failures: IntCounterVec,
    dispatch: IntCounterVec,
    pools: IntGauge,
    acl_rules: IntGauge,
}

impl ProxyMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let applied = IntCounterVec::new(
            Opts::new("concord_log_entries_applied_total", "Committed log entries applied"),
            &["op"],
        )?;
        let apply_failures = IntCounterVec::new(
            Opts::new(
                "concord_apply_failures_total",
                "Committed log entries whose apply returned an error",
            ),
            &["kind"],
        )?;
        let dispatch = IntCounterVec::new(
            Opts::new("concord_dispatch_total", "Dispatch decisions by outcome"),
            &["outcome"],
        )?;
        let pools = IntGauge::new("concord_pools", "Registered backend pools")?;
        let acl_rules = IntGauge::new("concord_acl_rules", "Registered ACL blocks")?;

        registry.register(Box::new(applied.clone()))?;
        registry.register(Box::new(apply_failures.clone()))?;
        registry.register(Box::new(dispatch.clone()))?;
        registry.register(Box::new(pools.clone()))?;
        registry.register(Box::new(acl_rules.clone()))?;

        Ok(Self {
            registry,
            applied,
            apply_failures,
            dispatch,
            pools,
            acl_rules,
        })
    }

    pub fn record_applied(&self, op: &str) {
        self.applied.with_label_values(&[op]).inc();
    }

    pub fn record_apply_failure(&self, kind: &str) {
        self.apply_failures.with_label_values(&[kind]).inc();
    }

    pub fn record_dispatch(&self, outcome: &str) {
        self.dispatch.with_label_values(&[outcome]).inc();
    }

    pub fn set_pools(&self, count: usize) {
        self.pools.set(count as i64);
    }

    pub fn set_acl_rules(&self, count: usize) {
        self.acl_rules.set(count as i64);
    }

    pub fn dispatch_count(&self, outcome: &str) -> u64 {
        self.dispatch.with_label_values(&[outcome]).get()
    }

    pub fn applied_count(&self, op: &str) -> u64 {
        self.applied.with_label_values(&[op]).get()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Text exposition format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl std::fmt::Debug for ProxyMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyMetrics").finish_non_exhaustive()
    }
}
