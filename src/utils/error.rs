//! Error types for mcbucket

use std::io;
use thiserror::Error;

use crate::protocol::Status;

/// Top-level driver error
#[derive(Error, Debug)]
pub enum McError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Query error: {0}")]
    Query(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Binary frame errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Short read: needed {needed} bytes, got {got}")]
    ShortRead { needed: usize, got: usize },

    #[error("Invalid magic byte: 0x{0:02X}")]
    InvalidMagic(u8),

    #[error("Unknown opcode: 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("Key too long: {0} bytes (max 65535)")]
    KeyTooLong(usize),

    #[error("Extras too long: {0} bytes (max 255)")]
    ExtrasTooLong(usize),
}

/// Topology and routing errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Config fetch failed for bucket {bucket}: no seed returned a usable config")]
    ConfigFetch { bucket: String },

    #[error("Bucket {0} not present in fetched configs")]
    BucketNotFound(String),

    #[error("Bucket {0} is a memcached-type bucket, which is not supported")]
    UnsupportedBucketType(String),

    #[error("Invalid vBucket map: {0}")]
    InvalidMap(String),

    #[error("No route: vBucket map not initialized")]
    NoRoute,

    #[error("vBucket {0} has no replica")]
    NoReplica(u16),
}

/// Socket-level errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to connect to {host}:{port}: {source}")]
    ConnectFailed {
        host: String,
        port: u16,
        source: io::Error,
    },

    #[error("Failed to resolve {host}: {source}")]
    ResolveFailed { host: String, source: io::Error },

    #[error("Connection to {0} is closed")]
    Closed(String),
}

impl ConnectionError {
    /// True when the underlying failure was a refused TCP connection,
    /// which indicates the topology may be stale.
    pub fn is_refused(&self) -> bool {
        match self {
            ConnectionError::ConnectFailed { source, .. } => {
                source.kind() == io::ErrorKind::ConnectionRefused
            }
            _ => false,
        }
    }
}

/// SASL handshake errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Server advertised no supported SASL mechanism: {0:?}")]
    NoSupportedMechanism(String),

    #[error("SASL {mechanism} rejected by server: {message}")]
    Rejected { mechanism: String, message: String },

    #[error("Malformed SCRAM challenge: {0}")]
    BadChallenge(String),

    #[error("Server signature verification failed")]
    BadServerSignature,

    #[error("Select bucket {bucket} failed: {message}")]
    SelectBucketFailed { bucket: String, message: String },
}

/// Dispatch-path errors
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Server returned status {status}: {message}")]
    Server { status: Status, message: String },

    #[error("Failed to acquire connections: {}", format_acquire_failures(.0))]
    Acquire(Vec<(String, String)>),
}

impl DispatchError {
    /// Status carried by a `Server` error, if any.
    pub fn status(&self) -> Option<Status> {
        match self {
            DispatchError::Server { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn format_acquire_failures(failures: &[(String, String)]) -> String {
    failures
        .iter()
        .map(|(server, err)| format!("{server}: {err}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, McError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_detection() {
        let err = ConnectionError::ConnectFailed {
            host: "10.0.0.1".to_string(),
            port: 11210,
            source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        };
        assert!(err.is_refused());

        let err = ConnectionError::ConnectFailed {
            host: "10.0.0.1".to_string(),
            port: 11210,
            source: io::Error::new(io::ErrorKind::TimedOut, "timed out"),
        };
        assert!(!err.is_refused());
    }

    #[test]
    fn test_acquire_error_format() {
        let err = DispatchError::Acquire(vec![
            ("10.0.0.1:11210".to_string(), "connection refused".to_string()),
            ("10.0.0.2:11210".to_string(), "timed out".to_string()),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("10.0.0.1:11210: connection refused"));
        assert!(msg.contains("10.0.0.2:11210: timed out"));
    }
}
