//! Engine configuration
//!
//! Loaded once at startup from an optional TOML file with environment
//! overrides (`FLOODGATE_` prefix, `__` as the section separator, so
//! `FLOODGATE_STORE__CAPACITY=500000` overrides `[store] capacity`).
//! Every field has a default; an empty config yields a working
//! in-memory engine with no policies, which allows everything.

use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::monitor::MonitorSettings;
use crate::policy::{BypassRules, LimitPolicy};
use crate::quota::TierQuota;

/// Fallback-store sizing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Initial entry capacity of the in-memory counter store
    pub capacity: usize,
    /// Seconds between expired-entry sweeps
    pub sweep_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            capacity: 100_000,
            sweep_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub alert_cooldown_secs: u64,
    pub subject_denial_threshold: u64,
    pub global_denial_threshold: u64,
    pub history_capacity: usize,
    pub alert_capacity: usize,
    /// Seconds between series-retention prune passes
    pub prune_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        let defaults = MonitorSettings::default();
        MonitorConfig {
            alert_cooldown_secs: defaults.alert_cooldown.as_secs(),
            subject_denial_threshold: defaults.subject_denial_threshold,
            global_denial_threshold: defaults.global_denial_threshold,
            history_capacity: defaults.history_capacity,
            alert_capacity: defaults.alert_capacity,
            prune_interval_secs: 60,
        }
    }
}

impl MonitorConfig {
    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            alert_cooldown: Duration::from_secs(self.alert_cooldown_secs),
            subject_denial_threshold: self.subject_denial_threshold,
            global_denial_threshold: self.global_denial_threshold,
            history_capacity: self.history_capacity,
            alert_capacity: self.alert_capacity,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Shared counter backend; `None` runs on the in-memory store only
    pub redis_url: Option<String>,
    /// Quota ledger database; `None` keeps the ledger in memory
    pub database_url: Option<String>,
    /// Budget for a single shared-backend operation before failover
    pub backend_timeout_ms: u64,
    /// Seconds between degraded-backend recovery probes
    pub probe_interval_secs: u64,
    /// Command buffer of the in-memory store actor
    pub actor_buffer: usize,
    pub store: StoreConfig,
    /// Per-endpoint limit policies, keyed inside by category.operation
    pub policies: Vec<LimitPolicy>,
    /// Service-wide policies counted against the shared global subject
    pub global_policies: Vec<LimitPolicy>,
    /// Resolver-wide tier multipliers (`-1` disables limiting)
    pub tier_multipliers: HashMap<String, f64>,
    /// Role multipliers, applied only when above one
    pub role_multipliers: HashMap<String, u32>,
    pub bypass: BypassRules,
    /// Cumulative allowances per tier
    pub tier_quotas: HashMap<String, TierQuota>,
    pub monitor: MonitorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            redis_url: None,
            database_url: None,
            backend_timeout_ms: 100,
            probe_interval_secs: 5,
            actor_buffer: 10_000,
            store: StoreConfig::default(),
            policies: Vec::new(),
            global_policies: Vec::new(),
            tier_multipliers: HashMap::new(),
            role_multipliers: HashMap::new(),
            bypass: BypassRules::default(),
            tier_quotas: HashMap::new(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from `path` (optional) with `FLOODGATE_*` overrides.
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder
            .add_source(Environment::with_prefix("FLOODGATE").separator("__"))
            .build()
            .context("failed to read configuration sources")?
            .try_deserialize()
            .context("invalid configuration")
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.store.sweep_interval_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.prune_interval_secs)
    }
}
