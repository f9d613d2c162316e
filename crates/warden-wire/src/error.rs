//! Error types for wire message verification and field access.

use crate::opcode::Opcode;
use thiserror::Error;

/// Wire-level errors
///
/// Every variant is a reason to reject a message outright; there is no
/// partial recovery from a malformed buffer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Buffer smaller than the fixed header
    #[error("message too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Opcode value outside the known space
    #[error("unknown opcode: 0x{0:08X}")]
    UnknownOpcode(u32),

    /// CRC over the message body does not match the header
    #[error("crc mismatch: expected 0x{expected:08X}, got 0x{got:08X}")]
    CrcMismatch {
        /// CRC stored in the header
        expected: u32,
        /// CRC computed over the body
        got: u32,
    },

    /// Payload smaller than the minimum for its opcode
    #[error("payload too short for {opcode:?}: expected at least {expected}, got {actual}")]
    PayloadTooShort {
        /// The message's opcode
        opcode: Opcode,
        /// Minimum payload size for that opcode
        expected: usize,
        /// Actual payload size
        actual: usize,
    },

    /// Typed view requested for a different opcode
    #[error("wrong opcode: expected {expected:?}, got {got:?}")]
    WrongOpcode {
        /// Opcode the view is defined for
        expected: Opcode,
        /// Opcode the message actually carries
        got: Opcode,
    },

    /// Embedded string is not valid UTF-8
    #[error("embedded string is not valid utf-8")]
    BadString,
}
