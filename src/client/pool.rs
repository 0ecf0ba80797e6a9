//! Per-client connection pool
//!
//! Sockets are pooled by `host:port:bucket`. A socket handed out for the
//! first time runs the SASL handshake and bucket selection; a reused one
//! is already `Ready` and skips both. Sockets are owned by one client and
//! never shared.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::client::auth::{authenticate, Credentials};
use crate::client::connection::Connection;
use crate::cluster::Server;
use crate::config::ClusterConfig;
use crate::utils::error::McError;

/// Pool key for a (node, bucket) pair.
pub fn pool_name(server: &Server, bucket: &str) -> String {
    format!("{}:{}", server.name(), bucket)
}

struct IdleConn {
    conn: Connection,
    parked_at: Instant,
}

/// Keyed keepalive pool with an idle timeout and a per-key idle cap.
pub struct ConnectionPool {
    idle: HashMap<String, Vec<IdleConn>>,
    max_idle: usize,
    idle_timeout: Duration,
    timeout: Duration,
}

impl ConnectionPool {
    pub fn new(cfg: &ClusterConfig) -> Self {
        Self {
            idle: HashMap::new(),
            max_idle: cfg.pool_size,
            idle_timeout: cfg.pool_idle_timeout(),
            timeout: cfg.timeout(),
        }
    }

    /// Hands out a `Ready` connection to `server`, reusing an idle socket
    /// when one is fresh enough, otherwise connecting and running the
    /// first-use handshake.
    pub fn acquire(
        &mut self,
        server: &Server,
        bucket: &str,
        creds: &Credentials,
    ) -> Result<Connection, McError> {
        let key = pool_name(server, bucket);
        self.prune(&key);

        if let Some(idle) = self.idle.get_mut(&key).and_then(|stack| stack.pop()) {
            let mut conn = idle.conn;
            conn.mark_reused();
            debug!(pool = %key, reuse_count = conn.reuse_count(), "reusing pooled socket");
            return Ok(conn);
        }

        let mut conn = Connection::connect(server, self.timeout)?;
        authenticate(&mut conn, creds, bucket)?;
        Ok(conn)
    }

    /// Returns a socket to the pool. Only `Ready` sockets are kept; a
    /// closed or mid-handshake socket is dropped.
    pub fn release(&mut self, server_name: &str, bucket: &str, conn: Connection) {
        if !conn.is_ready() {
            debug!(peer = conn.peer(), "dropping non-ready socket");
            return;
        }

        let key = format!("{server_name}:{bucket}");
        let stack = self.idle.entry(key).or_default();
        if stack.len() >= self.max_idle {
            return;
        }
        stack.push(IdleConn {
            conn,
            parked_at: Instant::now(),
        });
    }

    fn prune(&mut self, key: &str) {
        if let Some(stack) = self.idle.get_mut(key) {
            let idle_timeout = self.idle_timeout;
            stack.retain(|idle| idle.parked_at.elapsed() < idle_timeout);
        }
    }

    /// Applies a new per-operation timeout to every pooled socket and to
    /// future connections.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        for stack in self.idle.values_mut() {
            for idle in stack.iter_mut() {
                idle.conn.set_timeout(timeout).ok();
            }
        }
    }

    /// Closes every pooled socket.
    pub fn close_all(&mut self) {
        self.idle.clear();
    }

    pub fn idle_count(&self, server_name: &str, bucket: &str) -> usize {
        self.idle
            .get(&format!("{server_name}:{bucket}"))
            .map(|stack| stack.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::connection::ConnState;
    use crate::protocol::{Frame, Magic, Opcode};
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn test_cfg() -> ClusterConfig {
        ClusterConfig::new(Vec::new(), "beer").with_credentials("beer", "secret")
    }

    /// Accepts one connection and answers the PLAIN handshake.
    fn spawn_plain_server() -> (Server, thread::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let list = Frame::decode(&mut stream).unwrap();
            let mut reply = list.clone();
            reply.magic = Magic::Response;
            reply.value = b"PLAIN".to_vec();
            stream.write_all(&reply.encode().unwrap()).unwrap();

            let auth = Frame::decode(&mut stream).unwrap();
            assert_eq!(auth.opcode, Opcode::SaslAuth);
            let mut reply = auth.clone();
            reply.magic = Magic::Response;
            reply.value.clear();
            stream.write_all(&reply.encode().unwrap()).unwrap();

            // Hold the socket open so the pool can reuse it.
            thread::sleep(Duration::from_millis(200));
        });
        (Server::new("127.0.0.1", port), handle)
    }

    #[test]
    fn test_first_use_authenticates_then_reuses() {
        let (server, handle) = spawn_plain_server();
        let cfg = test_cfg();
        let mut pool = ConnectionPool::new(&cfg);
        let creds = Credentials {
            username: "beer".to_string(),
            password: "secret".to_string(),
        };

        let conn = pool.acquire(&server, "beer", &creds).unwrap();
        assert!(conn.is_ready());
        assert_eq!(conn.reuse_count(), 0);

        pool.release(server.name(), "beer", conn);
        assert_eq!(pool.idle_count(server.name(), "beer"), 1);

        // Second acquire skips the handshake entirely.
        let conn = pool.acquire(&server, "beer", &creds).unwrap();
        assert_eq!(conn.reuse_count(), 1);
        assert!(conn.is_ready());

        drop(conn);
        handle.join().unwrap();
    }

    #[test]
    fn test_non_ready_sockets_are_not_pooled() {
        let (server, handle) = spawn_plain_server();
        let cfg = test_cfg();
        let mut pool = ConnectionPool::new(&cfg);
        let creds = Credentials {
            username: "beer".to_string(),
            password: "secret".to_string(),
        };

        let mut conn = pool.acquire(&server, "beer", &creds).unwrap();
        conn.set_state(ConnState::Closed);
        pool.release(server.name(), "beer", conn);
        assert_eq!(pool.idle_count(server.name(), "beer"), 0);

        handle.join().unwrap();
    }

    #[test]
    fn test_idle_cap() {
        let cfg = test_cfg();
        let mut pool = ConnectionPool::new(&cfg);
        assert_eq!(pool.max_idle, 100);
        assert_eq!(pool.idle_timeout, Duration::from_millis(10_000));
    }
}
