//! Gateway wire protocol
//!
//! The envelope `{op, d, s, t}` and the handshake/control sub-payloads
//! exchanged with the remote gateway.

mod opcode;
mod payload;

pub use opcode::OpCode;
pub use payload::{
    encode, Hello, Identify, IdentifyProperties, Payload, Ready, Resume, READY_EVENT,
    RESUMED_EVENT,
};

/// Gateway API version appended to connection URLs
pub const API_VERSION: u8 = 10;
