//! Client connection layer
//!
//! This module provides:
//! - Raw blocking connections with the SASL handshake state machine
//! - The per-client keepalive pool keyed by `host:port:bucket`
//! - Single- and multi-packet dispatch with quiet-opcode pipelining
//! - The bucket client facade and the N1QL query helper

pub mod auth;
pub mod bucket_client;
pub mod connection;
pub mod dispatch;
pub mod pool;
pub mod query;

pub use auth::Credentials;
pub use bucket_client::{BucketClient, StoreValue};
pub use connection::{ConnState, Connection};
pub use dispatch::{send_many, send_one, BatchResult, Packet};
pub use pool::{pool_name, ConnectionPool};
