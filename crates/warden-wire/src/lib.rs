//! # Warden Wire
//!
//! Wire message format for the warden security-policy protocol.
//!
//! This crate provides:
//! - The message opcode space (connect, notify and policy families)
//! - CRC-protected message buffers with fail-closed verification
//! - Typed field views over verified messages
//! - A builder for constructing outbound messages
//!
//! Every message on the wire is a single datagram:
//!
//! ```text
//! ┌──────────┬──────────┬──────────────────────────────┐
//! │ crc: u32 │ op: u32  │ payload (layout per opcode)  │
//! └──────────┴──────────┴──────────────────────────────┘
//! ```
//!
//! All multi-byte fields are big-endian (network byte order). The CRC
//! covers everything after itself. Verification rejects a message on any
//! size, CRC or opcode mismatch before a single payload field is read.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod message;
pub mod opcode;

pub use error::WireError;
pub use message::{
    Ack, AuthChallenge, AuthReply, Hello, MsgBuilder, StreamChunk, VersionInfo, WireMsg,
};
pub use opcode::Opcode;

/// Lowest protocol version this client can speak
pub const PROTOCOL_MIN_VERSION: u32 = 3;

/// Native protocol version of this client
pub const PROTOCOL_VERSION: u32 = 7;

/// Legacy protocol version that only supports transport authentication
pub const PROTOCOL_VERSION_LEGACY: u32 = 3;

/// Fixed message header size in bytes (CRC + opcode)
pub const HEADER_SIZE: usize = 8;

/// Maximum chunk carried by a single outbound policy request message
pub const POLICY_CHUNK: usize = 3000;

/// Payload cap for csmulti request and reply messages
pub const CSMULTI_PAYLOAD_MAX: usize = 8000;

/// Stream flag: first message of a streamed exchange
pub const STREAM_START: u32 = 0x1;

/// Stream flag: last message of a streamed exchange
pub const STREAM_END: u32 = 0x2;

/// Checksum-request operation: list stored checksums for a directory
pub const CSUM_OP_LIST: u32 = 1;
