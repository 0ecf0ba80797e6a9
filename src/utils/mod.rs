//! Utility modules

pub mod crypto;
pub mod error;
pub mod http;

pub use error::{
    AuthError, ClusterError, ConnectionError, DispatchError, McError, ProtocolError, Result,
};
