//! Channel abstraction over the daemon connection.
//!
//! The session engine never touches sockets or TLS directly; it consumes
//! a message-oriented byte channel. One `send` carries exactly one wire
//! message, one `recv` yields exactly one. Framing, encryption and
//! connection setup belong to the implementation behind this trait.

use std::io;
use thiserror::Error;

/// Channel layer errors
#[derive(Debug, Error)]
pub enum ChannelError {
    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Channel is closed
    #[error("channel is closed")]
    Closed,
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

/// A synchronous, message-oriented channel to the policy daemon.
///
/// The session engine is single-threaded and caller-driven: `recv`
/// blocks until a complete message arrives (or the channel fails), and
/// the engine only calls it from the caller's own thread. There are no
/// deadlines at this layer; a stalled peer blocks `recv` indefinitely.
pub trait Channel {
    /// Send one complete wire message.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the message cannot be delivered.
    fn send(&mut self, msg: &[u8]) -> ChannelResult<()>;

    /// Receive one complete wire message, blocking until available.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if the channel fails or closes before
    /// a message arrives.
    fn recv(&mut self) -> ChannelResult<Vec<u8>>;

    /// Close the channel.
    ///
    /// # Errors
    ///
    /// Returns a [`ChannelError`] if teardown fails; the channel is
    /// unusable afterwards either way.
    fn close(&mut self) -> ChannelResult<()>;
}
