//! Driver configuration

use std::time::Duration;

/// Default per-operation socket timeout.
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Default number of config seeds to try per fetch.
pub const DEFAULT_MAX_TRIES: usize = 3;

/// Default idle lifetime of a pooled socket.
pub const DEFAULT_POOL_IDLE_TIMEOUT_MS: u64 = 10_000;

/// Default idle-socket cap per pool key.
pub const DEFAULT_POOL_SIZE: usize = 100;

/// Default minimum interval between topology reloads.
pub const DEFAULT_RELOAD_MIN_INTERVAL_SECS: u64 = 15;

/// Default number of cold-fetch gate slots.
pub const DEFAULT_FETCH_LOCK_SLOTS: usize = 20;

/// Connection settings for one (cluster, bucket) binding.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Seed `"host:port"` config endpoints.
    pub host_ports: Vec<String>,
    pub bucket_name: String,
    pub username: String,
    pub password: String,
    /// Registry key; distinct clusters must use distinct names.
    pub cluster_name: String,

    // Tuning knobs
    pub max_tries: usize,
    pub default_timeout_ms: u64,
    pub pool_max_idle_timeout_ms: u64,
    pub pool_size: usize,
    pub reload_min_interval_secs: u64,
    pub fetch_lock_slots: usize,
}

impl ClusterConfig {
    pub fn new(host_ports: Vec<String>, bucket_name: impl Into<String>) -> Self {
        Self {
            host_ports,
            bucket_name: bucket_name.into(),
            username: String::new(),
            password: String::new(),
            cluster_name: "default".to_string(),
            max_tries: DEFAULT_MAX_TRIES,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            pool_max_idle_timeout_ms: DEFAULT_POOL_IDLE_TIMEOUT_MS,
            pool_size: DEFAULT_POOL_SIZE,
            reload_min_interval_secs: DEFAULT_RELOAD_MIN_INTERVAL_SECS,
            fetch_lock_slots: DEFAULT_FETCH_LOCK_SLOTS,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_cluster_name(mut self, name: impl Into<String>) -> Self {
        self.cluster_name = name.into();
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = ms;
        self
    }

    pub fn with_reload_min_interval_secs(mut self, secs: u64) -> Self {
        self.reload_min_interval_secs = secs;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_max_idle_timeout_ms)
    }

    pub fn reload_min_interval(&self) -> Duration {
        Duration::from_secs(self.reload_min_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ClusterConfig::new(vec!["10.0.0.1:8091".to_string()], "beer");
        assert_eq!(cfg.cluster_name, "default");
        assert_eq!(cfg.max_tries, 3);
        assert_eq!(cfg.default_timeout_ms, 5000);
        assert_eq!(cfg.pool_max_idle_timeout_ms, 10_000);
        assert_eq!(cfg.pool_size, 100);
        assert_eq!(cfg.reload_min_interval_secs, 15);
        assert_eq!(cfg.fetch_lock_slots, 20);
    }

    #[test]
    fn test_builders() {
        let cfg = ClusterConfig::new(vec![], "beer")
            .with_credentials("beer", "secret")
            .with_cluster_name("prod")
            .with_timeout_ms(1000);
        assert_eq!(cfg.username, "beer");
        assert_eq!(cfg.cluster_name, "prod");
        assert_eq!(cfg.timeout(), Duration::from_millis(1000));
    }
}
