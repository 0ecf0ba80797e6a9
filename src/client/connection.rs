//! Raw TCP connection for bucket-data traffic
//!
//! Blocking sockets with per-operation timeouts; the timeout is the sole
//! deadline mechanism. A connection that errors transitions to `Closed`
//! and is never pooled again.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, error};

use crate::cluster::Server;
use crate::protocol::Frame;
use crate::utils::error::{ConnectionError, McError};

/// Handshake progress of one socket.
///
/// ```text
/// Connected --reused--> Ready
/// Connected -> SaslListed -> SaslAuthed -> SaslStepped -> Ready
/// any --error--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connected,
    SaslListed,
    SaslAuthed,
    SaslStepped,
    Ready,
    Closed,
}

/// One authenticated (or to-be-authenticated) socket to a data node.
#[derive(Debug)]
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    peer: String,
    state: ConnState,
    reuse_count: u32,
}

impl Connection {
    /// Opens a TCP connection to `server` with the given per-op timeout.
    pub fn connect(server: &Server, timeout: Duration) -> Result<Self, ConnectionError> {
        let addr = match (server.host(), server.port()).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().ok_or_else(|| ConnectionError::ResolveFailed {
                host: server.host().to_string(),
                source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
            })?,
            Err(e) => {
                error!(
                    host = server.host(),
                    "hostname resolution failed; check the resolver configuration of the embedding host"
                );
                return Err(ConnectionError::ResolveFailed {
                    host: server.host().to_string(),
                    source: e,
                });
            }
        };

        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
            ConnectionError::ConnectFailed {
                host: server.host().to_string(),
                port: server.port(),
                source: e,
            }
        })?;

        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(timeout)).ok();
        stream.set_write_timeout(Some(timeout)).ok();

        let writer = BufWriter::new(stream.try_clone().map_err(|e| {
            ConnectionError::ConnectFailed {
                host: server.host().to_string(),
                port: server.port(),
                source: e,
            }
        })?);
        let reader = BufReader::new(stream);

        debug!(peer = server.name(), "connected");
        Ok(Self {
            reader,
            writer,
            peer: server.name().to_string(),
            state: ConnState::Connected,
            reuse_count: 0,
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ConnState) {
        self.state = state;
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnState::Ready
    }

    /// Times this socket has been handed out from the pool. A non-zero
    /// count means it is already authenticated and bucket-selected.
    pub fn reuse_count(&self) -> u32 {
        self.reuse_count
    }

    pub(crate) fn mark_reused(&mut self) {
        self.reuse_count += 1;
    }

    /// Applies a new per-operation timeout to both stream halves.
    pub fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.reader.get_ref().set_read_timeout(Some(timeout))?;
        self.writer.get_ref().set_write_timeout(Some(timeout))?;
        Ok(())
    }

    /// Encodes and sends one frame. Any failure closes the socket.
    pub fn send(&mut self, frame: &Frame) -> Result<(), McError> {
        let bytes = frame.encode().map_err(|e| {
            self.state = ConnState::Closed;
            McError::Protocol(e)
        })?;
        self.writer
            .write_all(&bytes)
            .and_then(|_| self.writer.flush())
            .map_err(|e| {
                self.state = ConnState::Closed;
                McError::Io(e)
            })
    }

    /// Receives one frame. Any failure closes the socket.
    pub fn recv(&mut self) -> Result<Frame, McError> {
        Frame::decode(&mut self.reader).map_err(|e| {
            self.state = ConnState::Closed;
            McError::Protocol(e)
        })
    }

    /// Sends one frame and reads one response.
    pub fn roundtrip(&mut self, frame: &Frame) -> Result<Frame, McError> {
        self.send(frame)?;
        self.recv()
    }
}
