//! Process-wide cluster registry
//!
//! Buckets are keyed `cluster_name -> bucket_name` and created lazily on
//! first use. An entry lives forever and is refreshed in place: the
//! routing table behind its lock is rebound atomically from a freshly
//! fetched config, never mutated. Cold fetches are gated so racing
//! workers produce exactly one HTTP round-trip; reloads are bounded by a
//! per-bucket cooldown claimed with a compare-and-swap on a monotonic
//! timestamp.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::cluster::config_fetch::{build_vbucket, ConfigFetcher};
use crate::cluster::server::Server;
use crate::cluster::vbucket::VBucketMap;
use crate::config::ClusterConfig;
use crate::utils::error::{ClusterError, McError};

/// How long a losing worker waits before re-reading the registry.
const FETCH_WAIT: Duration = Duration::from_millis(500);

/// One bucket's live topology plus the machinery to refresh it.
pub struct BucketHandle {
    cluster: String,
    name: String,
    fetcher: ConfigFetcher,
    table: RwLock<Option<VBucketMap>>,
    /// Milliseconds since `epoch` of the last reload; 0 means "due now".
    last_reload_ms: AtomicU64,
    reload_min_interval: Duration,
    epoch: Instant,
}

impl BucketHandle {
    fn new(cfg: &ClusterConfig) -> Self {
        let fetcher = ConfigFetcher::new(
            &cfg.host_ports,
            &cfg.bucket_name,
            &cfg.username,
            &cfg.password,
            cfg.max_tries,
            cfg.timeout(),
        );
        let epoch = Instant::now();
        Self {
            cluster: cfg.cluster_name.clone(),
            name: cfg.bucket_name.clone(),
            fetcher,
            table: RwLock::new(None),
            last_reload_ms: AtomicU64::new(0),
            reload_min_interval: cfg.reload_min_interval(),
            epoch,
        }
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a routing table has been installed.
    pub fn is_initialized(&self) -> bool {
        self.table.read().is_some()
    }

    pub fn mask(&self) -> Option<u16> {
        self.table.read().as_ref().map(|t| t.mask())
    }

    /// Snapshot of the current node list.
    pub fn nodes(&self) -> Vec<Server> {
        self.table
            .read()
            .as_ref()
            .map(|t| t.nodes().to_vec())
            .unwrap_or_default()
    }

    /// Routes a key, cloning the chosen server out of the table lock.
    pub fn route(&self, key: &[u8], replica: bool) -> Result<(u16, Server), ClusterError> {
        let guard = self.table.read();
        let table = guard.as_ref().ok_or(ClusterError::NoRoute)?;
        let (vbucket, server) = table.route(key, replica)?;
        Ok((vbucket, server.clone()))
    }

    fn now_ms(&self) -> u64 {
        // Clamped to 1 so that 0 stays reserved for "reload due".
        (self.epoch.elapsed().as_millis() as u64).max(1)
    }

    /// Claims the reload window. At most one caller per cooldown interval
    /// wins, no matter how many observe routing errors concurrently.
    fn claim_reload_window(&self) -> bool {
        let now = self.now_ms();
        let last = self.last_reload_ms.load(Ordering::Acquire);
        if last != 0 && now.saturating_sub(last) < self.reload_min_interval.as_millis() as u64 {
            return false;
        }
        self.last_reload_ms
            .compare_exchange(last, now, Ordering::SeqCst, Ordering::Acquire)
            .is_ok()
    }

    /// Refreshes the topology in place, subject to the cooldown.
    ///
    /// Best-effort: on fetch failure the old table remains and the window
    /// stays consumed, bounding config traffic under error storms.
    /// Returns true when a new table was installed.
    pub fn reload(&self) -> bool {
        if !self.claim_reload_window() {
            debug!(bucket = %self.name, "topology reload skipped: cooldown window not elapsed");
            return false;
        }

        info!(cluster = %self.cluster, bucket = %self.name, "refreshing vBucket topology");
        match self
            .fetcher
            .fetch_configs()
            .and_then(|configs| build_vbucket(&configs, &self.name))
        {
            Ok(map) => {
                info!(
                    bucket = %self.name,
                    vbuckets = map.len(),
                    nodes = map.nodes().len(),
                    "vBucket topology refreshed"
                );
                *self.table.write() = Some(map);
                true
            }
            Err(e) => {
                warn!(bucket = %self.name, error = %e, "topology refresh failed; keeping previous map");
                false
            }
        }
    }

    fn install(&self, map: VBucketMap) {
        *self.table.write() = Some(map);
        let now = self.now_ms();
        self.last_reload_ms.store(now, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn force_reload_due(&self) {
        self.last_reload_ms.store(0, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn consume_reload_window(&self) -> bool {
        self.claim_reload_window()
    }
}

/// Cold-fetch gate: a fixed table of CAS slots keyed by cluster name.
///
/// The winner of a slot performs the HTTP fetch; losers sleep and re-read
/// the registry. Distinct clusters may collide on a slot, which only
/// serializes their first fetches.
struct FetchGate {
    slots: Vec<AtomicBool>,
}

impl FetchGate {
    fn new(slots: usize) -> Self {
        Self {
            slots: (0..slots.max(1)).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    fn slot(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.slots.len()
    }

    fn try_acquire(&self, key: &str) -> bool {
        self.slots[self.slot(key)]
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn release(&self, key: &str) {
        self.slots[self.slot(key)].store(false, Ordering::SeqCst);
    }
}

/// Registry of buckets per cluster.
///
/// Shared by reference across workers; every client created from the same
/// registry sees the same topology entries.
pub struct ClusterRegistry {
    clusters: RwLock<HashMap<String, HashMap<String, Arc<BucketHandle>>>>,
    gate: FetchGate,
    fetch_wait: Duration,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::with_fetch_slots(crate::config::DEFAULT_FETCH_LOCK_SLOTS)
    }

    pub fn with_fetch_slots(slots: usize) -> Self {
        Self {
            clusters: RwLock::new(HashMap::new()),
            gate: FetchGate::new(slots),
            fetch_wait: FETCH_WAIT,
        }
    }

    pub fn lookup(&self, cluster: &str, bucket: &str) -> Option<Arc<BucketHandle>> {
        self.clusters.read().get(cluster)?.get(bucket).cloned()
    }

    /// Returns the bucket entry, performing the initial topology fetch if
    /// this is the first use of the (cluster, bucket) pair.
    ///
    /// Racing workers are gated: exactly one fetches, the rest wait 0.5 s
    /// and read the populated entry.
    pub fn get_or_fetch(&self, cfg: &ClusterConfig) -> Result<Arc<BucketHandle>, McError> {
        loop {
            if let Some(handle) = self.lookup(&cfg.cluster_name, &cfg.bucket_name) {
                return Ok(handle);
            }

            if self.gate.try_acquire(&cfg.cluster_name) {
                let result = self.create_entry(cfg);
                self.gate.release(&cfg.cluster_name);
                return result;
            }

            debug!(
                cluster = %cfg.cluster_name,
                bucket = %cfg.bucket_name,
                "another worker is fetching this topology; waiting"
            );
            thread::sleep(self.fetch_wait);
        }
    }

    fn create_entry(&self, cfg: &ClusterConfig) -> Result<Arc<BucketHandle>, McError> {
        // The race winner may have inserted while we acquired the slot.
        if let Some(handle) = self.lookup(&cfg.cluster_name, &cfg.bucket_name) {
            return Ok(handle);
        }

        let handle = BucketHandle::new(cfg);
        let configs = handle.fetcher.fetch_configs()?;
        let map = build_vbucket(&configs, &cfg.bucket_name)?;
        handle.install(map);

        let handle = Arc::new(handle);
        self.clusters
            .write()
            .entry(cfg.cluster_name.clone())
            .or_default()
            .insert(cfg.bucket_name.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Test seam: installs a pre-built routing table without any fetch.
    pub fn insert_prebuilt(&self, cfg: &ClusterConfig, map: VBucketMap) -> Arc<BucketHandle> {
        let handle = BucketHandle::new(cfg);
        handle.install(map);
        let handle = Arc::new(handle);
        self.clusters
            .write()
            .entry(cfg.cluster_name.clone())
            .or_default()
            .insert(cfg.bucket_name.clone(), Arc::clone(&handle));
        handle
    }
}

impl Default for ClusterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::vbucket::VBucketEntry;

    fn test_map() -> VBucketMap {
        let nodes = vec![Server::new("n0", 11210), Server::new("n1", 11210)];
        let vmap = vec![
            VBucketEntry {
                primary: 0,
                replica: Some(1),
            },
            VBucketEntry {
                primary: 1,
                replica: Some(0),
            },
        ];
        VBucketMap::new("CRC", nodes, vmap).unwrap()
    }

    fn test_cfg() -> ClusterConfig {
        ClusterConfig::new(Vec::new(), "beer").with_cluster_name("test")
    }

    #[test]
    fn test_prebuilt_lookup() {
        let registry = ClusterRegistry::new();
        let cfg = test_cfg();
        registry.insert_prebuilt(&cfg, test_map());

        let handle = registry.lookup("test", "beer").unwrap();
        assert!(handle.is_initialized());
        assert_eq!(handle.mask(), Some(1));
    }

    #[test]
    fn test_uninitialized_routes_nowhere() {
        let cfg = test_cfg();
        let handle = BucketHandle::new(&cfg);
        assert!(matches!(
            handle.route(b"k", false),
            Err(ClusterError::NoRoute)
        ));
    }

    #[test]
    fn test_reload_cooldown() {
        let cfg = test_cfg();
        let registry = ClusterRegistry::new();
        let handle = registry.insert_prebuilt(&cfg, test_map());

        // The install consumed the window.
        assert!(!handle.consume_reload_window());

        // Once due, exactly one claim per window succeeds.
        handle.force_reload_due();
        assert!(handle.consume_reload_window());
        assert!(!handle.consume_reload_window());
    }

    #[test]
    fn test_failed_reload_keeps_old_table() {
        // Seeds are empty, so the refresh fetch can only fail.
        let cfg = test_cfg();
        let registry = ClusterRegistry::new();
        let handle = registry.insert_prebuilt(&cfg, test_map());

        handle.force_reload_due();
        assert!(!handle.reload());
        assert!(handle.is_initialized());
        assert_eq!(handle.mask(), Some(1));
    }

    #[test]
    fn test_gate_single_winner() {
        let gate = FetchGate::new(20);
        assert!(gate.try_acquire("default"));
        assert!(!gate.try_acquire("default"));
        gate.release("default");
        assert!(gate.try_acquire("default"));
    }

    #[test]
    fn test_gate_threads_race() {
        let gate = Arc::new(FetchGate::new(20));
        let winners: Vec<bool> = (0..8)
            .map(|_| {
                let gate = Arc::clone(&gate);
                thread::spawn(move || gate.try_acquire("default"))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .collect();
        assert_eq!(winners.iter().filter(|&&w| w).count(), 1);
    }

    #[test]
    fn test_cold_fetch_single_winner_populates_losers() {
        use std::io::{Read, Write};
        use std::net::TcpListener;
        use std::sync::atomic::AtomicUsize;

        // A loopback config endpoint that counts how many fetches land.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits = Arc::new(AtomicUsize::new(0));
        let server_hits = Arc::clone(&hits);
        thread::spawn(move || {
            let body = r#"{"name":"beer","bucketType":"membase","vBucketServerMap":{"hashAlgorithm":"CRC","serverList":["10.0.0.1:11210"],"vBucketMap":[[0,-1],[0,-1]]}}"#;
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                server_hits.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 2048];
                let mut captured = Vec::new();
                loop {
                    let n = stream.read(&mut buf).unwrap_or(0);
                    captured.extend_from_slice(&buf[..n]);
                    if n == 0 || captured.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
                let response = format!(
                    "HTTP/1.0 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });

        let cfg = ClusterConfig::new(vec![format!("127.0.0.1:{port}")], "beer")
            .with_cluster_name("race");
        let registry = Arc::new(ClusterRegistry::new());

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let cfg = cfg.clone();
                thread::spawn(move || registry.get_or_fetch(&cfg).unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&results[0], &results[1]));
        assert_eq!(results[0].mask(), Some(1));
    }
}
