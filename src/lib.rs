//! mcbucket - smart client driver for vBucket-sharded memcached clusters
//!
//! The driver speaks the binary memcached wire protocol extended with
//! vBucket routing, SASL (SCRAM-SHA1/PLAIN) authentication and cluster
//! topology acquired from the REST config endpoint. Keys are hashed onto
//! vBuckets, vBuckets map to nodes, and batches are pipelined per node
//! with quiet-opcode rewriting.
//!
//! ```no_run
//! use mcbucket::{BucketClient, ClusterConfig, ClusterRegistry};
//!
//! let registry = ClusterRegistry::new();
//! let cfg = ClusterConfig::new(vec!["10.0.0.1:8091".to_string()], "beer")
//!     .with_credentials("beer", "secret");
//! let mut client = BucketClient::connect(&registry, &cfg)?;
//!
//! client.set("doc:1", r#"{"n":1}"#, 0)?;
//! let _value = client.get("doc:1")?;
//! # Ok::<(), mcbucket::McError>(())
//! ```

pub mod client;
pub mod cluster;
pub mod config;
pub mod protocol;
pub mod utils;

pub use client::{BucketClient, Credentials, StoreValue};
pub use cluster::{ClusterRegistry, Server, VBucketMap};
pub use config::ClusterConfig;
pub use protocol::{Decoded, DecodedValue, Frame, Opcode, Status};
pub use utils::error::{McError, Result};
