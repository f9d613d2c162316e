//! Error types for the warden protocol client.

use crate::channel::ChannelError;
use crate::transaction::Token;
use thiserror::Error;
use warden_wire::WireError;

/// Client-level errors
///
/// Channel and wire failures bubble up from the layers below; the
/// remaining variants are either synchronous caller-misuse rejections
/// (no transaction is created) or session-fatal protocol violations.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Message failed wire-level verification
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Peer broke the protocol
    #[error("protocol violation: {0}")]
    Violation(&'static str),

    /// A transaction completed unsuccessfully
    #[error("operation failed: {0}")]
    Op(#[from] TxError),

    /// Peer does not support a required capability
    #[error("not supported: {0}")]
    NotSupported(&'static str),

    /// Operation not valid in the current session state
    #[error("invalid state for operation")]
    InvalidState,

    /// A policy-domain operation is already in flight
    #[error("a policy operation is already pending")]
    PolicyBusy,

    /// The token already addresses an active transaction
    #[error("token {0} already has an active transaction")]
    TokenInUse(Token),

    /// Caller-supplied parameter rejected
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// Terminal outcome of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxError {
    /// The channel failed while the transaction was in flight
    #[error("channel failed")]
    Channel,

    /// The peer broke the protocol
    #[error("protocol violation")]
    Protocol,

    /// The peer lacks a capability the transaction requires
    #[error("not supported by peer")]
    NotSupported,

    /// The peer reported an application-level error
    #[error("remote error {0}")]
    Remote(u32),
}

/// Result a transaction completes with
pub type TxResult = Result<(), TxError>;
