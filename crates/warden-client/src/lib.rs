//! # Warden Client
//!
//! Protocol client engine for the warden security-policy daemon.
//!
//! This crate provides:
//! - The session state machine (connect, close, error handling)
//! - The six-stage connect handshake with version and option negotiation
//! - The symmetric close handshake
//! - The notification queue and verdict replies
//! - Transaction correlation for single-ack, streamed and batched
//!   request shapes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Session                                 │
//! │   (one channel, state machine, dispatch, notification queue)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                       Transactions                              │
//! │   (token-addressed operations advanced one reply at a time)     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                      Wire messages                              │
//! │   (CRC-protected, opcode-tagged, fail-closed verification)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All processing is synchronous and single-threaded: the caller either
//! blocks in a convenience call (`connect`, `close`, `policy_request`,
//! ...) that pumps the channel until the driving transaction completes,
//! or integrates [`Session::process`] into its own event loop.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
mod close;
pub mod csmulti;
pub mod error;
mod handshake;
mod notify;
mod policy;
pub mod session;
mod transaction;

#[cfg(test)]
pub(crate) mod testutil;

pub use channel::{Channel, ChannelError, ChannelResult};
pub use csmulti::{CsKind, CsMultiOp, CsMultiRecord, CsMultiRequest, RecordState};
pub use error::{ClientError, TxError, TxResult};
pub use handshake::select_version;
pub use session::{
    AuthHandler, AuthType, ProtocolSet, Session, SessionConfig, SessionFlags, SessionState,
};
pub use transaction::{Completion, Token};

pub use warden_wire as wire;
