//! Bucket client facade
//!
//! A `BucketClient` is bound to one (cluster, bucket) pair. It owns its
//! sockets via a per-client pool and shares the bucket's topology handle
//! through the cluster registry. Commands are thin shells over the
//! dispatch path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::client::auth::Credentials;
use crate::client::connection::Connection;
use crate::client::dispatch::{self, Packet};
use crate::client::pool::ConnectionPool;
use crate::client::query;
use crate::cluster::{basic_auth_token, BucketHandle, ClusterRegistry};
use crate::config::ClusterConfig;
use crate::protocol::{decode_value, Decoded, Frame, Opcode};
use crate::utils::error::{DispatchError, McError, ProtocolError, Result};

/// Key for the `hello` feature negotiation.
const HELLO_KEY: &str = "mchello v1.0";

/// Feature selector sent with `hello`.
const HELLO_FEATURES: [u8; 2] = [0x0B, 0x00];

/// A value to store: raw bytes pass through, structured values are
/// JSON-encoded.
#[derive(Debug, Clone)]
pub enum StoreValue<'a> {
    Raw(&'a [u8]),
    Json(&'a Value),
}

impl<'a> From<&'a [u8]> for StoreValue<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        StoreValue::Raw(bytes)
    }
}

impl<'a> From<&'a str> for StoreValue<'a> {
    fn from(s: &'a str) -> Self {
        StoreValue::Raw(s.as_bytes())
    }
}

impl<'a> From<&'a Value> for StoreValue<'a> {
    fn from(value: &'a Value) -> Self {
        StoreValue::Json(value)
    }
}

impl StoreValue<'_> {
    fn into_bytes(self) -> Result<Vec<u8>> {
        match self {
            StoreValue::Raw(bytes) => Ok(bytes.to_vec()),
            StoreValue::Json(value) => Ok(serde_json::to_vec(value)?),
        }
    }
}

/// Client bound to one bucket of one cluster.
pub struct BucketClient {
    bucket: Arc<BucketHandle>,
    pool: ConnectionPool,
    creds: Credentials,
    basic_auth: String,
    n1ql_nodes: Vec<(String, u16)>,
    timeout: Duration,
    next_opaque: u32,
}

impl BucketClient {
    /// Binds a client, fetching the bucket topology on first use of the
    /// (cluster, bucket) pair.
    pub fn connect(registry: &ClusterRegistry, cfg: &ClusterConfig) -> Result<Self> {
        let bucket = registry.get_or_fetch(cfg)?;
        Ok(Self {
            bucket,
            pool: ConnectionPool::new(cfg),
            creds: Credentials {
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            },
            basic_auth: basic_auth_token(&cfg.username, &cfg.password),
            n1ql_nodes: Vec::new(),
            timeout: cfg.timeout(),
            next_opaque: 1,
        })
    }

    /// The topology handle this client routes with.
    pub fn bucket(&self) -> &BucketHandle {
        &self.bucket
    }

    fn next_opaque(&mut self) -> u32 {
        let opaque = self.next_opaque;
        self.next_opaque = self.next_opaque.wrapping_add(1);
        opaque
    }

    fn request(&mut self, opcode: Opcode, key: &str) -> Frame {
        let opaque = self.next_opaque();
        Frame::request(opcode).with_key(key).with_opaque(opaque)
    }

    fn send_single(&mut self, frame: Frame) -> Result<Frame> {
        dispatch::send_one(&self.bucket, &mut self.pool, &self.creds, Packet::new(frame))
    }

    // --- get family -------------------------------------------------

    pub fn get(&mut self, key: &str) -> Result<Decoded> {
        let response = self.send_single_get(Opcode::Get, key)?;
        Ok(decode_value(&response.extras, response.value))
    }

    pub fn getk(&mut self, key: &str) -> Result<Decoded> {
        let response = self.send_single_get(Opcode::GetK, key)?;
        Ok(decode_value(&response.extras, response.value))
    }

    /// Quiet get: the server suppresses its reply on a miss, so a miss
    /// comes back as `None` (detected via a pipelined noop barrier).
    pub fn getq(&mut self, key: &str) -> Result<Option<Decoded>> {
        self.quiet_get(Opcode::GetQ, key)
    }

    pub fn getkq(&mut self, key: &str) -> Result<Option<Decoded>> {
        self.quiet_get(Opcode::GetKQ, key)
    }

    /// Reads from the vBucket's replica instead of its primary.
    pub fn get_from_replica(&mut self, key: &str) -> Result<Decoded> {
        let frame = self.request(Opcode::GetReplica, key);
        let response =
            dispatch::send_one(&self.bucket, &mut self.pool, &self.creds, Packet::replica(frame))?;
        Ok(decode_value(&response.extras, response.value))
    }

    fn send_single_get(&mut self, opcode: Opcode, key: &str) -> Result<Frame> {
        let frame = self.request(opcode, key);
        self.send_single(frame)
    }

    // --- store family -----------------------------------------------

    pub fn set<'a>(&mut self, key: &str, value: impl Into<StoreValue<'a>>, expiry: u32) -> Result<u64> {
        self.store(Opcode::Set, key, value.into(), expiry, 0)
    }

    pub fn add<'a>(&mut self, key: &str, value: impl Into<StoreValue<'a>>, expiry: u32) -> Result<u64> {
        self.store(Opcode::Add, key, value.into(), expiry, 0)
    }

    pub fn replace<'a>(
        &mut self,
        key: &str,
        value: impl Into<StoreValue<'a>>,
        expiry: u32,
    ) -> Result<u64> {
        self.store(Opcode::Replace, key, value.into(), expiry, 0)
    }

    pub fn setq<'a>(&mut self, key: &str, value: impl Into<StoreValue<'a>>, expiry: u32) -> Result<()> {
        self.store_quiet(Opcode::SetQ, key, value.into(), expiry)
    }

    pub fn addq<'a>(&mut self, key: &str, value: impl Into<StoreValue<'a>>, expiry: u32) -> Result<()> {
        self.store_quiet(Opcode::AddQ, key, value.into(), expiry)
    }

    pub fn replaceq<'a>(
        &mut self,
        key: &str,
        value: impl Into<StoreValue<'a>>,
        expiry: u32,
    ) -> Result<()> {
        self.store_quiet(Opcode::ReplaceQ, key, value.into(), expiry)
    }

    /// Store with an explicit data type byte. The common shells above use
    /// data type 0.
    pub fn store(
        &mut self,
        opcode: Opcode,
        key: &str,
        value: StoreValue<'_>,
        expiry: u32,
        data_type: u8,
    ) -> Result<u64> {
        let mut frame = self
            .request(opcode, key)
            .with_extras(store_extras(expiry))
            .with_value(value.into_bytes()?);
        frame.data_type = data_type;
        let response = self.send_single(frame)?;
        Ok(response.cas)
    }

    fn store_quiet(
        &mut self,
        opcode: Opcode,
        key: &str,
        value: StoreValue<'_>,
        expiry: u32,
    ) -> Result<()> {
        let frame = self
            .request(opcode, key)
            .with_extras(store_extras(expiry))
            .with_value(value.into_bytes()?);
        self.quiet_roundtrip(frame).map(|_| ())
    }

    /// Appends raw bytes to an existing value.
    pub fn append(&mut self, key: &str, value: &[u8]) -> Result<u64> {
        let frame = self.request(Opcode::Append, key).with_value(value.to_vec());
        let response = self.send_single(frame)?;
        Ok(response.cas)
    }

    /// Prepends raw bytes to an existing value.
    pub fn prepend(&mut self, key: &str, value: &[u8]) -> Result<u64> {
        let frame = self.request(Opcode::Prepend, key).with_value(value.to_vec());
        let response = self.send_single(frame)?;
        Ok(response.cas)
    }

    // --- delete -----------------------------------------------------

    pub fn delete(&mut self, key: &str) -> Result<()> {
        let frame = self.request(Opcode::Delete, key);
        self.send_single(frame).map(|_| ())
    }

    pub fn deleteq(&mut self, key: &str) -> Result<()> {
        let frame = self.request(Opcode::DeleteQ, key);
        self.quiet_roundtrip(frame).map(|_| ())
    }

    // --- counters ---------------------------------------------------

    pub fn increment(&mut self, key: &str, delta: u64, initial: u64, expiry: u32) -> Result<u64> {
        self.counter(Opcode::Increment, key, delta, initial, expiry)
    }

    pub fn decrement(&mut self, key: &str, delta: u64, initial: u64, expiry: u32) -> Result<u64> {
        self.counter(Opcode::Decrement, key, delta, initial, expiry)
    }

    fn counter(
        &mut self,
        opcode: Opcode,
        key: &str,
        delta: u64,
        initial: u64,
        expiry: u32,
    ) -> Result<u64> {
        let mut extras = Vec::with_capacity(20);
        extras.extend_from_slice(&delta.to_be_bytes());
        extras.extend_from_slice(&initial.to_be_bytes());
        extras.extend_from_slice(&expiry.to_be_bytes());

        let frame = self.request(opcode, key).with_extras(extras);
        let response = self.send_single(frame)?;
        if response.value.len() != 8 {
            return Err(McError::Protocol(ProtocolError::ShortRead {
                needed: 8,
                got: response.value.len(),
            }));
        }
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&response.value);
        Ok(u64::from_be_bytes(bytes))
    }

    // --- expiry -----------------------------------------------------

    pub fn touch(&mut self, key: &str, expiry: u32) -> Result<()> {
        let frame = self
            .request(Opcode::Touch, key)
            .with_extras(expiry.to_be_bytes().to_vec());
        self.send_single(frame).map(|_| ())
    }

    // --- bulk -------------------------------------------------------

    /// Fetches many keys in one pipelined batch per node. The result maps
    /// key -> value for keys that answered with success; misses and
    /// errors are simply absent.
    pub fn get_bulk(&mut self, keys: &[&str]) -> Result<HashMap<String, Decoded>> {
        let mut opaque_to_key: HashMap<u32, String> = HashMap::with_capacity(keys.len());
        let mut packets = Vec::with_capacity(keys.len());
        for key in keys {
            let frame = self.request(Opcode::Get, key);
            opaque_to_key.insert(frame.opaque, (*key).to_string());
            packets.push(Packet::new(frame));
        }

        let batch = dispatch::send_many(&self.bucket, &mut self.pool, &self.creds, packets)?;

        let mut out = HashMap::new();
        for response in batch.responses {
            if !response.status().is_success() {
                continue;
            }
            if let Some(key) = opaque_to_key.get(&response.opaque) {
                out.insert(key.clone(), decode_value(&response.extras, response.value));
            }
        }
        Ok(out)
    }

    // --- admin ------------------------------------------------------

    /// Negotiates features; returns the feature codes the server enabled.
    pub fn hello(&mut self) -> Result<Vec<u16>> {
        let frame = self
            .request(Opcode::Hello, HELLO_KEY)
            .with_value(HELLO_FEATURES.to_vec());
        let response = self.send_single(frame)?;
        Ok(response
            .value
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect())
    }

    pub fn noop(&mut self) -> Result<()> {
        let frame = self.request(Opcode::Noop, "");
        self.send_single(frame).map(|_| ())
    }

    /// Server version string of the routed node.
    pub fn version(&mut self) -> Result<String> {
        let frame = self.request(Opcode::Version, "");
        let response = self.send_single(frame)?;
        Ok(String::from_utf8_lossy(&response.value).into_owned())
    }

    /// Explicitly rebinds the wire-selected bucket on a fresh connection.
    pub fn select_bucket(&mut self, name: &str) -> Result<()> {
        let server = self.first_node()?;
        let mut conn = self.pool.acquire(&server, self.bucket.name(), &self.creds)?;
        let opaque = self.next_opaque();
        let frame = Frame::request(Opcode::SelectBucket)
            .with_key(name)
            .with_opaque(opaque);
        let result = conn.roundtrip(&frame);
        match result {
            Ok(response) if response.status().is_success() => {
                self.pool.release(server.name(), self.bucket.name(), conn);
                Ok(())
            }
            Ok(response) => {
                self.pool.release(server.name(), self.bucket.name(), conn);
                Err(DispatchError::Server {
                    status: response.status(),
                    message: String::from_utf8_lossy(&response.value).into_owned(),
                }
                .into())
            }
            Err(e) => Err(e),
        }
    }

    /// Flushes every node of the bucket.
    pub fn flush(&mut self) -> Result<()> {
        for server in self.bucket.nodes() {
            let mut conn = self.pool.acquire(&server, self.bucket.name(), &self.creds)?;
            let opaque = self.next_opaque();
            let frame = Frame::request(Opcode::Flush).with_opaque(opaque);
            let response = conn.roundtrip(&frame)?;
            self.pool.release(server.name(), self.bucket.name(), conn);
            if !response.status().is_success() {
                return Err(DispatchError::Server {
                    status: response.status(),
                    message: String::from_utf8_lossy(&response.value).into_owned(),
                }
                .into());
            }
        }
        Ok(())
    }

    /// Quiet flush of every node; success replies are suppressed and
    /// errors detected via the noop barrier.
    pub fn flushq(&mut self) -> Result<()> {
        for server in self.bucket.nodes() {
            let mut conn = self.pool.acquire(&server, self.bucket.name(), &self.creds)?;
            let quiet_opaque = self.next_opaque();
            let frame = Frame::request(Opcode::FlushQ).with_opaque(quiet_opaque);
            let noop_opaque = self.next_opaque();
            let noop = Frame::request(Opcode::Noop).with_opaque(noop_opaque);

            let result = self.quiet_exchange(&mut conn, &frame, &noop, quiet_opaque, noop_opaque);
            if conn.is_ready() {
                self.pool.release(server.name(), self.bucket.name(), conn);
            }
            result?;
        }
        Ok(())
    }

    /// Per-node stats; `key` selects a stats group, empty for the
    /// default. The server streams k/v pairs terminated by an empty key.
    pub fn stats(&mut self, key: &str) -> Result<HashMap<String, HashMap<String, String>>> {
        let mut out = HashMap::new();
        for server in self.bucket.nodes() {
            let mut conn = self.pool.acquire(&server, self.bucket.name(), &self.creds)?;
            let opaque = self.next_opaque();
            let frame = Frame::request(Opcode::Stat).with_key(key).with_opaque(opaque);
            conn.send(&frame)?;

            let mut node_stats = HashMap::new();
            loop {
                let response = conn.recv()?;
                if !response.status().is_success() {
                    return Err(DispatchError::Server {
                        status: response.status(),
                        message: String::from_utf8_lossy(&response.value).into_owned(),
                    }
                    .into());
                }
                if response.key.is_empty() {
                    break;
                }
                node_stats.insert(
                    String::from_utf8_lossy(&response.key).into_owned(),
                    String::from_utf8_lossy(&response.value).into_owned(),
                );
            }

            self.pool.release(server.name(), self.bucket.name(), conn);
            out.insert(server.name().to_string(), node_stats);
        }
        Ok(out)
    }

    // --- query ------------------------------------------------------

    /// Runs a N1QL statement, discovering query nodes on first use.
    pub fn query(&mut self, statement: &str) -> Result<Value> {
        if self.n1ql_nodes.is_empty() {
            self.discover_n1ql_nodes()?;
        }
        query::run_query(&self.n1ql_nodes, &self.basic_auth, statement, self.timeout)
    }

    fn discover_n1ql_nodes(&mut self) -> Result<()> {
        let (_, server) = self.bucket.route(b"", false)?;
        let mut conn = self.pool.acquire(&server, self.bucket.name(), &self.creds)?;
        let opaque = self.next_opaque();
        let frame = Frame::request(Opcode::GetClusterConfig).with_opaque(opaque);
        let response = conn.roundtrip(&frame)?;
        self.pool.release(server.name(), self.bucket.name(), conn);

        if !response.status().is_success() {
            return Err(DispatchError::Server {
                status: response.status(),
                message: String::from_utf8_lossy(&response.value).into_owned(),
            }
            .into());
        }

        self.n1ql_nodes = query::parse_n1ql_nodes(&response.value, server.host())?;
        Ok(())
    }

    // --- lifecycle --------------------------------------------------

    /// Applies a new per-operation timeout to every socket this client
    /// owns and to future connections.
    pub fn set_timeout(&mut self, ms: u64) {
        self.timeout = Duration::from_millis(ms);
        self.pool.set_timeout(self.timeout);
    }

    /// Closes every socket this client owns.
    pub fn close(&mut self) {
        self.pool.close_all();
    }

    // --- internals --------------------------------------------------

    fn first_node(&self) -> Result<crate::cluster::Server> {
        self.bucket
            .nodes()
            .into_iter()
            .next()
            .ok_or_else(|| crate::utils::error::ClusterError::NoRoute.into())
    }

    /// Quiet get with a noop barrier: `None` means the reply was
    /// suppressed (a miss).
    fn quiet_get(&mut self, opcode: Opcode, key: &str) -> Result<Option<Decoded>> {
        let frame = self.request(opcode, key);
        Ok(self
            .quiet_roundtrip(frame)?
            .map(|response| decode_value(&response.extras, response.value)))
    }

    /// Sends a quiet packet followed by a noop on the same connection and
    /// drains until the noop answers. Returns the quiet packet's reply if
    /// one arrived; an error reply surfaces as an error.
    fn quiet_roundtrip(&mut self, frame: Frame) -> Result<Option<Frame>> {
        let (vbucket, server) = self.bucket.route(&frame.key, false)?;
        let mut frame = frame;
        frame.set_vbucket(vbucket);
        let quiet_opaque = frame.opaque;

        let noop_opaque = self.next_opaque();
        let noop = Frame::request(Opcode::Noop).with_opaque(noop_opaque);

        let mut conn = self.pool.acquire(&server, self.bucket.name(), &self.creds)?;
        let result = self.quiet_exchange(&mut conn, &frame, &noop, quiet_opaque, noop_opaque);
        if conn.is_ready() {
            self.pool.release(server.name(), self.bucket.name(), conn);
        }
        result
    }

    fn quiet_exchange(
        &mut self,
        conn: &mut Connection,
        frame: &Frame,
        noop: &Frame,
        quiet_opaque: u32,
        noop_opaque: u32,
    ) -> Result<Option<Frame>> {
        conn.send(frame)?;
        conn.send(noop)?;

        let mut quiet_reply: Option<Frame> = None;
        loop {
            let response = conn.recv()?;
            if response.opaque == noop_opaque {
                break;
            }
            if response.opaque == quiet_opaque {
                quiet_reply = Some(response);
            }
        }

        match quiet_reply {
            Some(response) if !response.status().is_success() => {
                if response.status().is_not_my_vbucket() {
                    self.bucket.reload();
                }
                Err(DispatchError::Server {
                    status: response.status(),
                    message: String::from_utf8_lossy(&response.value).into_owned(),
                }
                .into())
            }
            other => Ok(other),
        }
    }
}

fn store_extras(expiry: u32) -> Vec<u8> {
    // flags word (zero) followed by expiry, 8 bytes total.
    let mut extras = Vec::with_capacity(8);
    extras.extend_from_slice(&[0, 0, 0, 0]);
    extras.extend_from_slice(&expiry.to_be_bytes());
    extras
}
