//! Session state machine and message dispatch.
//!
//! A [`Session`] owns one channel to the policy daemon and multiplexes
//! the policy and notification sub-protocols over it. All processing is
//! synchronous and caller-driven: feed inbound messages through
//! [`Session::process`] (or let [`Session::pump`]/[`Session::wait`]
//! receive them), and the dispatcher routes each one either to the
//! notification queue or to the active transaction it belongs to.

use crate::channel::Channel;
use crate::csmulti::step_csmulti;
use crate::error::{ClientError, TxError, TxResult};
use crate::policy::{step_ack, step_stream, step_version};
use crate::transaction::{Completion, Outcome, Token, Transaction, TransactionSet, TxKind};
use std::collections::{HashMap, VecDeque};
use warden_wire::{Opcode, WireMsg};

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, handshake not yet started
    Init,
    /// Connect handshake in progress
    Connecting,
    /// Negotiation complete, normal operation
    Connected,
    /// Close handshake in progress
    Closing,
    /// Both close acknowledgments exchanged, channel quiescent
    Closed,
    /// Terminal failure; all further operations are rejected
    Error,
}

/// Per-session flag bitmap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags(u32);

impl SessionFlags {
    /// Peer accepted connection multiplexing
    pub const MULTIPLEX: u32 = 0b0000_0001;
    /// Peer accepted request pipelining
    pub const PIPELINE: u32 = 0b0000_0010;
    /// We sent a close request
    pub const SENT_CLOSEREQ: u32 = 0b0000_0100;
    /// Peer sent a close request
    pub const GOT_CLOSEREQ: u32 = 0b0000_1000;
    /// We acknowledged the peer's close request
    pub const SENT_CLOSEACK: u32 = 0b0001_0000;
    /// Peer acknowledged our close request
    pub const GOT_CLOSEACK: u32 = 0b0010_0000;
    /// A policy-domain request is in flight
    pub const POLICY_PENDING: u32 = 0b0100_0000;

    /// Create new empty flags
    #[must_use]
    pub fn new() -> Self {
        Self(0)
    }

    /// Check whether all bits in `flags` are set
    #[must_use]
    pub fn contains(self, flags: u32) -> bool {
        self.0 & flags == flags
    }

    /// Set the given bits
    pub fn insert(&mut self, flags: u32) {
        self.0 |= flags;
    }

    /// Clear the given bits
    pub fn remove(&mut self, flags: u32) {
        self.0 &= !flags;
    }

    /// Get the raw bitmap
    #[must_use]
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Set of sub-protocols negotiated over one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProtocolSet(u32);

impl ProtocolSet {
    /// Policy management sub-protocol
    pub const POLICY: Self = Self(0b01);
    /// Live notification delivery sub-protocol
    pub const NOTIFY: Self = Self(0b10);

    const KNOWN: u32 = 0b11;

    /// The empty set
    #[must_use]
    pub fn empty() -> Self {
        Self(0)
    }

    /// Check whether all protocols in `other` are in this set
    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Check whether the set is empty
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Check whether the set names protocols this client does not know
    #[must_use]
    pub fn has_unknown_bits(self) -> bool {
        self.0 & !Self::KNOWN != 0
    }
}

impl std::ops::BitOr for ProtocolSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Authentication type announced during the handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum AuthType {
    /// Trust the transport's own authentication
    #[default]
    Transport = 0,
    /// Transport authentication plus a signing key challenge
    TransportAndKey = 1,
}

/// Callback supplying signed bytes during the authentication exchange.
///
/// The session never inspects the challenge or the response; signing is
/// entirely the handler's business.
pub trait AuthHandler {
    /// Produce the response to one inbound `AuthData` challenge.
    ///
    /// # Errors
    ///
    /// Returning an error aborts the handshake.
    fn respond(&mut self, challenge: &WireMsg) -> Result<Vec<u8>, ClientError>;
}

/// Session configuration parameters
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionConfig {
    /// Authentication type to announce
    pub auth_type: AuthType,
}

/// A client session with the policy daemon
pub struct Session<C: Channel> {
    pub(crate) chan: C,
    pub(crate) state: SessionState,
    pub(crate) flags: SessionFlags,
    pub(crate) requested: ProtocolSet,
    selected: ProtocolSet,
    pub(crate) server_version: u32,
    pub(crate) server_min_version: u32,
    pub(crate) selected_version: u32,
    pub(crate) auth_type: AuthType,
    pub(crate) auth: Option<Box<dyn AuthHandler>>,
    pub(crate) auth_uid: u32,
    pub(crate) transactions: TransactionSet,
    notifications: VecDeque<WireMsg>,
    finished: HashMap<Token, Completion>,
}

impl<C: Channel> Session<C> {
    /// Create a new session bound to a channel
    #[must_use]
    pub fn new(chan: C, config: SessionConfig) -> Self {
        Self {
            chan,
            state: SessionState::Init,
            flags: SessionFlags::new(),
            requested: ProtocolSet::empty(),
            selected: ProtocolSet::empty(),
            server_version: 0,
            server_min_version: 0,
            selected_version: 0,
            auth_type: config.auth_type,
            auth: None,
            auth_uid: 0,
            transactions: TransactionSet::new(),
            notifications: VecDeque::new(),
            finished: HashMap::new(),
        }
    }

    /// Borrow the underlying channel
    #[must_use]
    pub fn channel(&self) -> &C {
        &self.chan
    }

    /// Mutably borrow the underlying channel, e.g. to poll its
    /// descriptor from an external event loop
    #[must_use]
    pub fn channel_mut(&mut self) -> &mut C {
        &mut self.chan
    }

    /// Install the signing callback for key-based authentication.
    ///
    /// Must be installed before [`Session::connect_start`] when the
    /// configured auth type is [`AuthType::TransportAndKey`].
    pub fn set_auth_handler(&mut self, handler: Box<dyn AuthHandler>) {
        self.auth = Some(handler);
    }

    /// Get the current session state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get the session flag bitmap
    #[must_use]
    pub fn flags(&self) -> SessionFlags {
        self.flags
    }

    /// Sub-protocols selected by the completed handshake
    #[must_use]
    pub fn protocols(&self) -> ProtocolSet {
        self.selected
    }

    /// Record the negotiated sub-protocol set (handshake completion)
    pub(crate) fn set_protocols(&mut self, protocols: ProtocolSet) {
        self.selected = protocols;
    }

    /// The server's native protocol version, as announced in its greeting
    #[must_use]
    pub fn server_version(&self) -> u32 {
        self.server_version
    }

    /// The oldest protocol version the server still accepts
    #[must_use]
    pub fn server_min_version(&self) -> u32 {
        self.server_min_version
    }

    /// The protocol version this session settled on
    #[must_use]
    pub fn selected_version(&self) -> u32 {
        self.selected_version
    }

    /// User id the server authenticated this session as
    #[must_use]
    pub fn auth_uid(&self) -> u32 {
        self.auth_uid
    }

    /// Number of transactions currently in flight
    #[must_use]
    pub fn active_transactions(&self) -> usize {
        self.transactions.len()
    }

    /// Feed one raw inbound message through verification and dispatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the session is not processing messages, the
    /// message fails verification, or it constitutes a session-fatal
    /// protocol violation. Transaction-scoped failures are reported
    /// through the transaction's [`Completion`] instead.
    pub fn process(&mut self, raw: Vec<u8>) -> Result<(), ClientError> {
        if !matches!(
            self.state,
            SessionState::Connecting | SessionState::Connected | SessionState::Closing
        ) {
            return Err(ClientError::InvalidState);
        }

        let msg = match WireMsg::verify(raw) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!(%err, "rejecting unverifiable message");
                self.fail_session(TxError::Protocol);
                return Err(err.into());
            }
        };

        self.scan_close(&msg);
        self.dispatch(msg)
    }

    /// Receive one message from the channel and process it.
    ///
    /// # Errors
    ///
    /// Propagates channel failures (which are session-fatal) and every
    /// error [`Session::process`] can report.
    pub fn pump(&mut self) -> Result<(), ClientError> {
        let raw = match self.chan.recv() {
            Ok(raw) => raw,
            Err(err) => {
                self.fail_session(TxError::Channel);
                return Err(err.into());
            }
        };
        self.process(raw)
    }

    /// Pump messages until the transaction with `token` completes.
    ///
    /// Blocks for as long as the peer takes; there are no deadlines at
    /// this layer.
    ///
    /// # Errors
    ///
    /// Propagates the first session-level error encountered while
    /// pumping.
    pub fn wait(&mut self, token: Token) -> Result<Completion, ClientError> {
        loop {
            if let Some(completion) = self.finished.remove(&token) {
                return Ok(completion);
            }
            self.pump()?;
        }
    }

    /// Collect the completion for `token`, if that transaction finished.
    ///
    /// Completions are keyed by token; collect one before starting
    /// another operation on the same token, or the older completion is
    /// replaced.
    pub fn take_completion(&mut self, token: Token) -> Option<Completion> {
        self.finished.remove(&token)
    }

    /// Check whether the transaction with `token` has finished
    #[must_use]
    pub fn is_done(&self, token: Token) -> bool {
        self.finished.contains_key(&token)
    }

    /// Pop the oldest pending notification, if any
    pub fn next_notification(&mut self) -> Option<WireMsg> {
        self.notifications.pop_front()
    }

    /// Check whether notifications are queued, without blocking
    #[must_use]
    pub fn has_notifications(&self) -> bool {
        !self.notifications.is_empty()
    }

    /// Pre-dispatch close tracking.
    ///
    /// Runs unconditionally on every inbound message, before routing, so
    /// close signaling cannot be missed even by callers that never drive
    /// the close transaction themselves.
    fn scan_close(&mut self, msg: &WireMsg) {
        match msg.opcode() {
            Opcode::CloseReq => {
                self.flags.insert(SessionFlags::GOT_CLOSEREQ);
                if self.state == SessionState::Connected {
                    tracing::debug!("peer requested close");
                    self.state = SessionState::Closing;
                }
            }
            Opcode::CloseAck => {
                self.flags.insert(SessionFlags::GOT_CLOSEACK);
            }
            _ => {}
        }
    }

    fn dispatch(&mut self, msg: WireMsg) -> Result<(), ClientError> {
        let opcode = msg.opcode();

        if opcode.is_client_only() {
            self.fail_session(TxError::Protocol);
            return Err(ClientError::Violation("server sent a client-to-server opcode"));
        }

        if opcode.is_notify_event() {
            tracing::debug!(?opcode, token = ?msg.token(), "queueing notification");
            self.notifications.push_back(msg);
            return Ok(());
        }

        let token = msg.token().unwrap_or(0);
        let Some(mut tx) = self.transactions.take(token, true) else {
            if opcode.is_close() {
                // Recorded by the pre-dispatch scan; nothing to route.
                if opcode == Opcode::CloseAck && !self.flags.contains(SessionFlags::GOT_CLOSEREQ) {
                    self.fail_session(TxError::Protocol);
                    return Err(ClientError::Violation("close acknowledged before being requested"));
                }
                return Ok(());
            }
            self.fail_session(TxError::Protocol);
            return Err(ClientError::Violation("message matches no active transaction"));
        };

        if !tx.accepts(opcode) {
            tracing::warn!(?opcode, token, "unexpected opcode for transaction");
            let scoped = tx.session_scoped();
            self.finish(tx, Err(TxError::Protocol));
            if scoped {
                self.fail_session(TxError::Protocol);
                return Err(ClientError::Violation("unexpected opcode during session handshake"));
            }
            return Ok(());
        }

        let step = match &mut tx.kind {
            TxKind::Handshake(state) => self.step_handshake(state, &msg),
            TxKind::Close => self.step_close(&msg),
            TxKind::Ack(state) => Ok(step_ack(*state, &msg)),
            TxKind::Stream(state) => Ok(step_stream(state, &mut tx.messages, msg)),
            TxKind::CsMulti(state) => Ok(step_csmulti(state, msg)),
            TxKind::VersionQuery => Ok(step_version(&mut tx.messages, msg)),
        };

        let outcome = match step {
            Ok(outcome) => outcome,
            Err(err) => {
                self.finish(tx, Err(TxError::Channel));
                self.fail_session(TxError::Channel);
                return Err(err);
            }
        };

        match outcome {
            Outcome::Continue => {
                self.transactions.reinsert(tx);
                Ok(())
            }
            Outcome::Done(result) => {
                let scoped = tx.session_scoped();
                let failure = result.err();
                self.finish(tx, result);
                if let Some(cause) = failure {
                    if scoped {
                        self.fail_session(cause);
                        return Err(ClientError::Op(cause));
                    }
                }
                Ok(())
            }
        }
    }

    /// Record a transaction's terminal result and release its policy slot
    pub(crate) fn finish(&mut self, tx: Transaction, result: TxResult) {
        if tx.clears_policy_pending() {
            self.flags.remove(SessionFlags::POLICY_PENDING);
        }
        tracing::debug!(token = tx.token, ok = result.is_ok(), "transaction finished");
        let completion = tx.into_completion(result);
        self.finished.insert(completion.token, completion);
    }

    /// Move the session to the terminal error state and tear down the
    /// channel, failing every outstanding transaction.
    pub(crate) fn fail_session(&mut self, cause: TxError) {
        if matches!(self.state, SessionState::Error | SessionState::Closed) {
            return;
        }
        tracing::warn!(?cause, state = ?self.state, "session entering error state");
        self.state = SessionState::Error;
        if let Err(err) = self.chan.close() {
            tracing::debug!(%err, "channel close during teardown failed");
        }
        for tx in self.transactions.drain() {
            self.finish(tx, Err(cause));
        }
    }

    /// Send one outbound message, escalating channel failures
    pub(crate) fn send(&mut self, raw: &[u8]) -> Result<(), ClientError> {
        if let Err(err) = self.chan.send(raw) {
            self.fail_session(TxError::Channel);
            return Err(err.into());
        }
        Ok(())
    }
}
