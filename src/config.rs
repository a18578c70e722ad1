use crate::core::{FlowlogError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon configuration, passed explicitly into every component.
///
/// All intervals are expressed in seconds so that the JSON file stays flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowlogConfig {
    /// Root of every coordination path (`/{namespace}/...`).
    pub namespace: String,

    /// Identity written into `updated_by`. Defaults to the hostname.
    pub node_identity: String,

    /// Period of the global collect trigger.
    pub collect_interval_secs: u64,

    /// Period of the global purge trigger.
    pub purge_interval_secs: u64,

    /// Length of one per-account collection window.
    pub collection_window_secs: u64,

    /// Upper bound on catch-up tasks chained for one lagging account.
    pub max_correction_runs: u32,

    /// Archive objects older than this are purged.
    pub purge_retention_days: u32,

    /// Expiry of coordination locks held by a crashed node.
    pub lock_ttl_secs: u64,

    /// The tick start is backdated by this much before computing the next trigger.
    pub tick_slack_secs: u64,

    /// How often this node's scheduler ticks both cycles.
    pub scheduler_tick_secs: u64,

    /// Number of local workers draining the dispatch queue.
    pub worker_concurrency: usize,

    pub dispatch_retry: DispatchRetryPolicy,

    /// Shared directory used by the filesystem coordination backend.
    pub coordination_root: PathBuf,

    /// Directory holding one sub-directory per bucket.
    pub archive_root: PathBuf,

    pub upstream: UpstreamConfig,
}

/// Retry behaviour of the local dispatch queue for a failing task step.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchRetryPolicy {
    /// Total attempts per step, including the first one.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for DispatchRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
        }
    }
}

impl DispatchRetryPolicy {
    /// Backoff before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let ms = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Telemetry API endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub api_url: String,
    pub api_token: Option<String>,
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8080".to_string(),
            api_token: None,
            timeout_secs: 30,
        }
    }
}

impl Default for FlowlogConfig {
    fn default() -> Self {
        Self {
            namespace: "flowlog".to_string(),
            node_identity: detect_node_identity(),
            collect_interval_secs: 3600,
            purge_interval_secs: 86_400,
            collection_window_secs: 3600,
            max_correction_runs: 12,
            purge_retention_days: 7,
            lock_ttl_secs: 300,
            tick_slack_secs: 10,
            scheduler_tick_secs: 60,
            worker_concurrency: 4,
            dispatch_retry: DispatchRetryPolicy::default(),
            coordination_root: PathBuf::from("/var/lib/flowlogd/coordination"),
            archive_root: PathBuf::from("/var/lib/flowlogd/archive"),
            upstream: UpstreamConfig::default(),
        }
    }
}

impl FlowlogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a JSON config file, applies `FLOWLOGD_*` overrides and validates.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            FlowlogError::Config(format!("Failed to read '{}': {}", path.display(), err))
        })?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|err| {
            FlowlogError::Config(format!("Failed to parse '{}': {}", path.display(), err))
        })?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overrides selected fields from an environment lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("FLOWLOGD_NAMESPACE") {
            self.namespace = value;
        }
        if let Some(value) = lookup("FLOWLOGD_NODE_IDENTITY") {
            self.node_identity = value;
        }
        if let Some(value) = lookup("FLOWLOGD_COORDINATION_ROOT") {
            self.coordination_root = PathBuf::from(value);
        }
        if let Some(value) = lookup("FLOWLOGD_ARCHIVE_ROOT") {
            self.archive_root = PathBuf::from(value);
        }
        if let Some(value) = lookup("FLOWLOGD_API_URL") {
            self.upstream.api_url = value;
        }
        if let Some(value) = lookup("FLOWLOGD_API_TOKEN") {
            self.upstream.api_token = Some(value);
        }
    }

    pub fn validate(&self) -> Result<()> {
        let namespace = self.namespace.trim_matches('/');
        if namespace.is_empty() || namespace.contains("..") {
            return Err(FlowlogError::Config(format!(
                "namespace '{}' is not a valid path segment",
                self.namespace
            )));
        }
        if self.node_identity.trim().is_empty() {
            return Err(FlowlogError::Config(
                "node_identity must not be empty".to_string(),
            ));
        }
        for (name, value) in [
            ("collect_interval_secs", self.collect_interval_secs),
            ("purge_interval_secs", self.purge_interval_secs),
            ("collection_window_secs", self.collection_window_secs),
            ("lock_ttl_secs", self.lock_ttl_secs),
            ("scheduler_tick_secs", self.scheduler_tick_secs),
        ] {
            if value == 0 {
                return Err(FlowlogError::Config(format!("{} must be positive", name)));
            }
        }
        for (name, value) in [
            ("collect_interval_secs", self.collect_interval_secs),
            ("purge_interval_secs", self.purge_interval_secs),
            ("collection_window_secs", self.collection_window_secs),
            ("lock_ttl_secs", self.lock_ttl_secs),
            ("scheduler_tick_secs", self.scheduler_tick_secs),
            ("tick_slack_secs", self.tick_slack_secs),
        ] {
            if value > MAX_DURATION_SECS {
                return Err(FlowlogError::Config(format!(
                    "{} must be at most {} seconds",
                    name, MAX_DURATION_SECS
                )));
            }
        }
        if self.purge_retention_days > MAX_RETENTION_DAYS {
            return Err(FlowlogError::Config(format!(
                "purge_retention_days must be at most {}",
                MAX_RETENTION_DAYS
            )));
        }
        if self.worker_concurrency == 0 {
            return Err(FlowlogError::Config(
                "worker_concurrency must be positive".to_string(),
            ));
        }
        if self.dispatch_retry.max_attempts == 0 {
            return Err(FlowlogError::Config(
                "dispatch_retry.max_attempts must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the namespace
    pub fn namespace(mut self, namespace: &str) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Set the node identity
    pub fn node_identity(mut self, identity: &str) -> Self {
        self.node_identity = identity.to_string();
        self
    }

    pub fn collect_interval(mut self, interval: Duration) -> Self {
        self.collect_interval_secs = interval.as_secs();
        self
    }

    pub fn purge_interval(mut self, interval: Duration) -> Self {
        self.purge_interval_secs = interval.as_secs();
        self
    }

    pub fn collection_window(mut self, window: Duration) -> Self {
        self.collection_window_secs = window.as_secs();
        self
    }

    pub fn max_correction_runs(mut self, max: u32) -> Self {
        self.max_correction_runs = max;
        self
    }

    pub fn purge_retention_days(mut self, days: u32) -> Self {
        self.purge_retention_days = days;
        self
    }

    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl_secs = ttl.as_secs();
        self
    }

    pub fn tick_slack(mut self, slack: Duration) -> Self {
        self.tick_slack_secs = slack.as_secs();
        self
    }

    pub fn scheduler_tick(mut self, every: Duration) -> Self {
        self.scheduler_tick_secs = every.as_secs();
        self
    }

    pub fn worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers;
        self
    }

    pub fn dispatch_retry(mut self, policy: DispatchRetryPolicy) -> Self {
        self.dispatch_retry = policy;
        self
    }

    pub fn coordination_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.coordination_root = root.into();
        self
    }

    pub fn archive_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.archive_root = root.into();
        self
    }

    pub fn collect_interval_duration(&self) -> chrono::Duration {
        seconds(self.collect_interval_secs)
    }

    pub fn purge_interval_duration(&self) -> chrono::Duration {
        seconds(self.purge_interval_secs)
    }

    pub fn collection_window_duration(&self) -> chrono::Duration {
        seconds(self.collection_window_secs)
    }

    pub fn tick_slack_duration(&self) -> chrono::Duration {
        seconds(self.tick_slack_secs)
    }

    pub fn purge_retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.purge_retention_days))
    }

    pub fn lock_ttl_duration(&self) -> Duration {
        Duration::from_secs(self.lock_ttl_secs)
    }

    pub fn scheduler_tick_duration(&self) -> Duration {
        Duration::from_secs(self.scheduler_tick_secs)
    }
}

/// Upper bound for every configured duration: one hundred years. Cursor
/// arithmetic stays inside chrono's range below it.
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 86_400;

pub const MAX_RETENTION_DAYS: u32 = 100 * 365;

fn seconds(secs: u64) -> chrono::Duration {
    // Bounded by MAX_DURATION_SECS, so the cast is lossless.
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// Hostname of this machine, or a random fallback when it cannot be read.
pub fn detect_node_identity() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| format!("flowlogd-{}", uuid::Uuid::new_v4().simple()))
}
