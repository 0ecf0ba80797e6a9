//! Cluster topology and routing
//!
//! This module provides:
//! - Node identity and the vBucket routing table
//! - Config acquisition from the cluster REST endpoint
//! - The process-wide registry with gated cold fetches and bounded
//!   in-place refresh

pub mod config_fetch;
pub mod registry;
pub mod server;
pub mod vbucket;

pub use config_fetch::{basic_auth_token, build_vbucket, BucketConfig, ConfigFetcher};
pub use registry::{BucketHandle, ClusterRegistry};
pub use server::Server;
pub use vbucket::{vbucket_index, VBucketEntry, VBucketMap};
