//! Request dispatch
//!
//! Single-packet dispatch is route -> acquire -> send -> receive. Batch
//! dispatch groups packets by routed node, rewrites all but the last
//! packet per node to the quiet opcode, pipelines the sends and then
//! drains responses per connection until the terminal packet answers.
//! A "not my vbucket" status triggers at most one bounded topology
//! reload per batch.

use std::collections::{HashMap, HashSet};

use tracing::{debug, warn};

use crate::client::auth::Credentials;
use crate::client::connection::Connection;
use crate::client::pool::ConnectionPool;
use crate::cluster::{BucketHandle, Server};
use crate::protocol::Frame;
use crate::utils::error::{ConnectionError, DispatchError, McError};

/// A frame plus its routing hint.
#[derive(Debug, Clone)]
pub struct Packet {
    pub frame: Frame,
    pub is_replica: bool,
}

impl Packet {
    pub fn new(frame: Frame) -> Self {
        Self {
            frame,
            is_replica: false,
        }
    }

    pub fn replica(frame: Frame) -> Self {
        Self {
            frame,
            is_replica: true,
        }
    }
}

/// Outcome of a batch: responses in arrival order plus per-packet errors
/// keyed by packet opaque.
#[derive(Debug, Default)]
pub struct BatchResult {
    pub responses: Vec<Frame>,
    pub errors: HashMap<u32, McError>,
}

/// Sends one packet and reads its response.
///
/// A non-success status surfaces as an error carrying the response value
/// bytes; "not my vbucket" additionally triggers the bucket's bounded
/// reload before the error is returned.
pub fn send_one(
    bucket: &BucketHandle,
    pool: &mut ConnectionPool,
    creds: &Credentials,
    mut packet: Packet,
) -> Result<Frame, McError> {
    let (vbucket, server) = bucket.route(&packet.frame.key, packet.is_replica)?;
    packet.frame.set_vbucket(vbucket);

    let mut conn = match pool.acquire(&server, bucket.name(), creds) {
        Ok(conn) => conn,
        Err(e) => {
            reload_if_refused(bucket, &e);
            return Err(e);
        }
    };

    match conn.roundtrip(&packet.frame) {
        Ok(response) => {
            pool.release(server.name(), bucket.name(), conn);
            check_status(bucket, response)
        }
        Err(e) => Err(e),
    }
}

fn check_status(bucket: &BucketHandle, response: Frame) -> Result<Frame, McError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.is_not_my_vbucket() {
        debug!(bucket = bucket.name(), "response says not my vbucket; scheduling topology reload");
        bucket.reload();
    }
    Err(DispatchError::Server {
        status,
        message: String::from_utf8_lossy(&response.value).into_owned(),
    }
    .into())
}

fn reload_if_refused(bucket: &BucketHandle, error: &McError) {
    if let McError::Connection(conn_err) = error {
        if conn_err.is_refused() {
            debug!(bucket = bucket.name(), "connection refused; scheduling topology reload");
            bucket.reload();
        }
    }
}

struct Group {
    server: Server,
    packet_idxs: Vec<usize>,
}

/// Sends a batch of packets, grouped and pipelined per destination node.
///
/// Acquire failures abort the whole batch with an aggregated error.
/// Send and read failures are reported per packet; responses that do
/// arrive are returned regardless.
pub fn send_many(
    bucket: &BucketHandle,
    pool: &mut ConnectionPool,
    creds: &Credentials,
    mut packets: Vec<Packet>,
) -> Result<BatchResult, McError> {
    // Group by destination, preserving first-seen group order and packet
    // order within each group.
    let mut groups: Vec<Group> = Vec::new();
    let mut group_by_server: HashMap<String, usize> = HashMap::new();
    for (idx, packet) in packets.iter_mut().enumerate() {
        let (vbucket, server) = bucket.route(&packet.frame.key, packet.is_replica)?;
        packet.frame.set_vbucket(vbucket);

        match group_by_server.get(server.name()) {
            Some(&gi) => groups[gi].packet_idxs.push(idx),
            None => {
                group_by_server.insert(server.name().to_string(), groups.len());
                groups.push(Group {
                    server,
                    packet_idxs: vec![idx],
                });
            }
        }
    }

    // One connection per group; any acquire failure fails the batch.
    let mut conns: Vec<Option<Connection>> = Vec::with_capacity(groups.len());
    let mut acquire_failures: Vec<(String, String)> = Vec::new();
    let mut refused = false;
    for group in &groups {
        match pool.acquire(&group.server, bucket.name(), creds) {
            Ok(conn) => conns.push(Some(conn)),
            Err(e) => {
                if let McError::Connection(conn_err) = &e {
                    refused |= conn_err.is_refused();
                }
                acquire_failures.push((group.server.name().to_string(), e.to_string()));
                conns.push(None);
            }
        }
    }
    if !acquire_failures.is_empty() {
        for (group, conn) in groups.iter().zip(conns.into_iter()) {
            if let Some(conn) = conn {
                pool.release(group.server.name(), bucket.name(), conn);
            }
        }
        if refused {
            bucket.reload();
        }
        return Err(DispatchError::Acquire(acquire_failures).into());
    }

    // Quiet rewrite: all but the last packet of a multi-packet group.
    for group in &groups {
        rewrite_quiet(&mut packets, &group.packet_idxs);
    }

    // Phase 1: pipeline the sends in order, recording per-packet errors.
    let mut sent = vec![false; packets.len()];
    let mut errors: HashMap<u32, McError> = HashMap::new();
    for (group, conn) in groups.iter().zip(conns.iter_mut()) {
        let conn = conn.as_mut().expect("acquired above");
        for &idx in &group.packet_idxs {
            match conn.send(&packets[idx].frame) {
                Ok(()) => sent[idx] = true,
                Err(e) => {
                    warn!(peer = conn.peer(), opaque = packets[idx].frame.opaque, error = %e, "batch send failed");
                    errors.insert(packets[idx].frame.opaque, e);
                }
            }
        }
    }

    // Phase 2: drain each connection until its terminal packet answers.
    let mut responses: Vec<Frame> = Vec::new();
    let mut saw_not_my_vbucket = false;
    for (group, conn_slot) in groups.iter().zip(conns.into_iter()) {
        let mut conn = conn_slot.expect("acquired above");

        let terminal = *group.packet_idxs.last().expect("groups are non-empty");
        if !sent[terminal] {
            // The pipeline broke before the terminal packet; there is no
            // bounded way to read, so the socket is abandoned.
            mark_unanswered(&group.packet_idxs, &sent, &HashSet::new(), &packets, conn.peer(), &mut errors);
            continue;
        }

        let mut answered: HashSet<u32> = HashSet::new();
        let terminal_opaque = packets[terminal].frame.opaque;
        loop {
            match conn.recv() {
                Ok(response) => {
                    if response.status().is_not_my_vbucket() {
                        saw_not_my_vbucket = true;
                    }
                    answered.insert(response.opaque);
                    let is_terminal = response.opaque == terminal_opaque;
                    responses.push(response);
                    if is_terminal {
                        break;
                    }
                }
                Err(e) => {
                    warn!(peer = conn.peer(), error = %e, "batch read failed");
                    mark_unanswered(&group.packet_idxs, &sent, &answered, &packets, conn.peer(), &mut errors);
                    break;
                }
            }
        }

        pool.release(group.server.name(), bucket.name(), conn);
    }

    if saw_not_my_vbucket {
        debug!(bucket = bucket.name(), "batch saw not-my-vbucket responses; scheduling topology reload");
        bucket.reload();
    }

    Ok(BatchResult { responses, errors })
}

/// Substitutes quiet opcodes for every packet of the group except the
/// last, where a quiet counterpart is defined.
fn rewrite_quiet(packets: &mut [Packet], group_idxs: &[usize]) {
    if group_idxs.len() < 2 {
        return;
    }
    for &idx in &group_idxs[..group_idxs.len() - 1] {
        let frame = &mut packets[idx].frame;
        if let Some(quiet) = frame.opcode.quiet() {
            frame.opcode = quiet;
        }
    }
}

fn mark_unanswered(
    group_idxs: &[usize],
    sent: &[bool],
    answered: &HashSet<u32>,
    packets: &[Packet],
    peer: &str,
    errors: &mut HashMap<u32, McError>,
) {
    for &idx in group_idxs {
        let opaque = packets[idx].frame.opaque;
        if sent[idx] && !answered.contains(&opaque) && !errors.contains_key(&opaque) {
            errors.insert(
                opaque,
                McError::Connection(ConnectionError::Closed(peer.to_string())),
            );
        }
    }
}
