//! Binary wire protocol
//!
//! This module provides the frame codec for the 24-byte-header binary
//! protocol, the opcode/status tables with the quiet-variant mapping, and
//! the flags-driven interpretation of response values.

pub mod frame;
pub mod opcode;

pub use frame::{
    decode_value, Decoded, DecodedValue, Frame, Magic, HEADER_SIZE, MAX_EXTRA_LEN, MAX_KEY_LEN,
    REQUEST_MAGIC, RESPONSE_MAGIC,
};
pub use opcode::{Opcode, Status};
