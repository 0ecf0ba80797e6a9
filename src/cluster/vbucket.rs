//! vBucket routing table
//!
//! Keys hash into a fixed, power-of-two number of vBuckets; each vBucket
//! maps to a primary node and an optional replica. The table is an
//! immutable snapshot; topology refresh swaps in a whole new one.

use crate::cluster::server::Server;
use crate::utils::error::ClusterError;

/// One vBucket entry: indices into the table's node list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VBucketEntry {
    pub primary: u16,
    pub replica: Option<u16>,
}

/// Routing table snapshot for one bucket.
#[derive(Debug, Clone)]
pub struct VBucketMap {
    hash_algorithm: String,
    nodes: Vec<Server>,
    vmap: Vec<VBucketEntry>,
    mask: u16,
}

impl VBucketMap {
    /// Builds a table, validating the vBucket-count and index invariants.
    pub fn new(
        hash_algorithm: impl Into<String>,
        nodes: Vec<Server>,
        vmap: Vec<VBucketEntry>,
    ) -> Result<Self, ClusterError> {
        if nodes.is_empty() {
            return Err(ClusterError::InvalidMap("empty server list".to_string()));
        }
        if vmap.is_empty() || !vmap.len().is_power_of_two() {
            return Err(ClusterError::InvalidMap(format!(
                "vBucket count {} is not a power of two",
                vmap.len()
            )));
        }
        for (idx, entry) in vmap.iter().enumerate() {
            if entry.primary as usize >= nodes.len() {
                return Err(ClusterError::InvalidMap(format!(
                    "vBucket {idx} primary index {} out of range",
                    entry.primary
                )));
            }
            if let Some(replica) = entry.replica {
                if replica as usize >= nodes.len() {
                    return Err(ClusterError::InvalidMap(format!(
                        "vBucket {idx} replica index {replica} out of range"
                    )));
                }
            }
        }

        let mask = (vmap.len() - 1) as u16;
        Ok(Self {
            hash_algorithm: hash_algorithm.into(),
            nodes,
            vmap,
            mask,
        })
    }

    pub fn hash_algorithm(&self) -> &str {
        &self.hash_algorithm
    }

    pub fn nodes(&self) -> &[Server] {
        &self.nodes
    }

    pub fn mask(&self) -> u16 {
        self.mask
    }

    /// Number of vBuckets in the table.
    pub fn len(&self) -> usize {
        self.vmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vmap.is_empty()
    }

    /// vBucket index for a key.
    pub fn vbucket_for_key(&self, key: &[u8]) -> u16 {
        vbucket_index(key, self.mask)
    }

    /// Routes a key to `(vbucket_id, server)`.
    ///
    /// The node returned is exactly the one the topology specified; there
    /// is no client-side balancing.
    pub fn route(&self, key: &[u8], replica: bool) -> Result<(u16, &Server), ClusterError> {
        let idx = self.vbucket_for_key(key);
        let entry = &self.vmap[idx as usize];
        let node_idx = if replica {
            entry.replica.ok_or(ClusterError::NoReplica(idx))?
        } else {
            entry.primary
        };
        Ok((idx, &self.nodes[node_idx as usize]))
    }

    pub fn entry(&self, vbucket: u16) -> Option<&VBucketEntry> {
        self.vmap.get(vbucket as usize)
    }
}

/// vBucket index for a key under the given mask:
/// `(crc32(key) >> 16) & 0x7FFF & mask`.
pub fn vbucket_index(key: &[u8], mask: u16) -> u16 {
    let h = crc32fast::hash(key);
    ((h >> 16) as u16 & 0x7FFF) & mask
}
