//! Cluster config acquisition
//!
//! Fetches the per-bucket config from the cluster REST endpoint on one of
//! the seed nodes and translates its `vBucketServerMap` into a routing
//! table.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cluster::server::Server;
use crate::cluster::vbucket::{VBucketEntry, VBucketMap};
use crate::utils::error::ClusterError;
use crate::utils::http;

/// Per-bucket config document, as served by
/// `GET /pools/default/buckets/<bucket>`.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    pub name: String,
    #[serde(rename = "bucketType", default)]
    pub bucket_type: Option<String>,
    #[serde(rename = "vBucketServerMap")]
    pub vbucket_server_map: Option<VBucketServerMap>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VBucketServerMap {
    #[serde(rename = "hashAlgorithm", default = "default_hash_algorithm")]
    pub hash_algorithm: String,
    #[serde(rename = "serverList")]
    pub server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    pub vbucket_map: Vec<Vec<i32>>,
}

fn default_hash_algorithm() -> String {
    "CRC".to_string()
}

/// Fetches bucket configs from the cluster REST endpoint.
///
/// Seed order is shuffled once at construction; each fetch walks up to
/// `min(max_tries, seeds)` of them.
pub struct ConfigFetcher {
    seeds: Vec<Server>,
    bucket: String,
    basic_auth: String,
    max_tries: usize,
    timeout: Duration,
}

impl ConfigFetcher {
    pub fn new(
        host_ports: &[String],
        bucket: &str,
        username: &str,
        password: &str,
        max_tries: usize,
        timeout: Duration,
    ) -> Self {
        let mut seeds: Vec<Server> = host_ports.iter().filter_map(|a| Server::parse(a)).collect();
        fastrand::shuffle(&mut seeds);

        Self {
            seeds,
            bucket: bucket.to_string(),
            basic_auth: basic_auth_token(username, password),
            max_tries,
            timeout,
        }
    }

    /// Walks the seeds and returns the configs from the first seed whose
    /// response body parses as JSON. Zero usable configs is a hard error.
    pub fn fetch_configs(&self) -> Result<Vec<BucketConfig>, ClusterError> {
        let tries = self.max_tries.min(self.seeds.len());

        for seed in self.seeds.iter().take(tries) {
            match self.fetch_from_seed(seed) {
                Ok(configs) => {
                    debug!(
                        seed = seed.name(),
                        bucket = %self.bucket,
                        configs = configs.len(),
                        "fetched cluster config"
                    );
                    return Ok(configs);
                }
                Err(e) => {
                    warn!(seed = seed.name(), bucket = %self.bucket, error = %e, "config fetch failed on seed");
                    continue;
                }
            }
        }

        Err(ClusterError::ConfigFetch {
            bucket: self.bucket.clone(),
        })
    }

    fn fetch_from_seed(&self, seed: &Server) -> Result<Vec<BucketConfig>, String> {
        let path = format!("/pools/default/buckets/{}", self.bucket);
        let response = http::get(
            seed.host(),
            seed.port(),
            &path,
            Some(&self.basic_auth),
            self.timeout,
        )
        .map_err(|e| e.to_string())?;

        // The endpoint answers errors with plain text ("Requested resource
        // not found."); only a JSON object body is a config.
        if response.body.first() != Some(&b'{') {
            return Err(format!(
                "seed returned non-JSON body (status {})",
                response.status
            ));
        }

        let config: BucketConfig =
            serde_json::from_slice(&response.body).map_err(|e| e.to_string())?;
        Ok(vec![config])
    }
}

/// `base64(user:pass)`; an empty password encodes as the empty string.
pub fn basic_auth_token(username: &str, password: &str) -> String {
    BASE64.encode(format!("{username}:{password}"))
}

/// Locates the config for `bucket_name` and builds its routing table.
///
/// Memcached-type buckets have no vBucket map and are rejected outright.
pub fn build_vbucket(
    configs: &[BucketConfig],
    bucket_name: &str,
) -> Result<VBucketMap, ClusterError> {
    let config = configs
        .iter()
        .find(|c| c.name == bucket_name)
        .ok_or_else(|| ClusterError::BucketNotFound(bucket_name.to_string()))?;

    if config.bucket_type.as_deref() == Some("memcached") {
        return Err(ClusterError::UnsupportedBucketType(bucket_name.to_string()));
    }

    let server_map = config
        .vbucket_server_map
        .as_ref()
        .ok_or_else(|| ClusterError::InvalidMap("config has no vBucketServerMap".to_string()))?;

    let nodes: Vec<Server> = server_map
        .server_list
        .iter()
        .map(|addr| {
            Server::parse(addr)
                .ok_or_else(|| ClusterError::InvalidMap(format!("bad server address {addr}")))
        })
        .collect::<Result<_, _>>()?;

    let vmap: Vec<VBucketEntry> = server_map
        .vbucket_map
        .iter()
        .enumerate()
        .map(|(idx, entry)| {
            let primary = *entry
                .first()
                .ok_or_else(|| ClusterError::InvalidMap(format!("vBucket {idx} is empty")))?;
            if primary < 0 {
                return Err(ClusterError::InvalidMap(format!(
                    "vBucket {idx} has no primary"
                )));
            }
            let replica = entry
                .get(1)
                .copied()
                .filter(|&r| r >= 0)
                .map(|r| r as u16);
            Ok(VBucketEntry {
                primary: primary as u16,
                replica,
            })
        })
        .collect::<Result<_, _>>()?;

    VBucketMap::new(server_map.hash_algorithm.clone(), nodes, vmap)
}
