//! Transaction correlation for request/reply traffic.
//!
//! A transaction is a token-addressed, opcode-gated state holder that is
//! advanced by feeding it one reply message at a time until it reports
//! completion. Each kind of operation carries its own typed state in
//! [`TxKind`]; the session dispatches on the tag, so installing the
//! wrong step logic for an operation is unrepresentable.

use crate::csmulti::CsMultiRequest;
use crate::error::{ClientError, TxResult};
use crate::handshake::HandshakeState;
use std::collections::HashMap;
use warden_wire::{Opcode, WireMsg};

/// Correlation token tying a request to its replies.
///
/// Token 0 is reserved for session-scoped operations (the connect and
/// close handshakes, passphrase delivery); caller-issued requests use
/// nonzero tokens of their choosing.
pub type Token = u64;

/// State of a single-request/single-ack transaction
#[derive(Debug, Clone, Copy)]
pub(crate) struct AckState {
    /// Opcode the peer's ack must acknowledge
    pub acked: Opcode,
}

/// State of a streamed START..END reply transaction
#[derive(Debug, Clone, Copy)]
pub(crate) struct StreamState {
    /// Opcode the reply stream is framed in
    pub reply: Opcode,
    /// Whether the START-flagged first message has been seen
    pub started: bool,
}

/// State of a batched multi-record transaction
#[derive(Debug)]
pub(crate) struct CsMultiState {
    /// The caller's request, held for the flight and returned on completion
    pub request: CsMultiRequest,
}

/// The kind of an active transaction, with its per-kind state
#[derive(Debug)]
pub(crate) enum TxKind {
    /// Connect handshake (token 0)
    Handshake(HandshakeState),
    /// Close handshake (token 0; state lives in the session flags)
    Close,
    /// Single request, single generic ack
    Ack(AckState),
    /// Streamed START..END reply accumulation
    Stream(StreamState),
    /// Batched multi-record checksum/signature exchange
    CsMulti(CsMultiState),
    /// Daemon version query
    VersionQuery,
}

/// An in-flight transaction
#[derive(Debug)]
pub(crate) struct Transaction {
    pub token: Token,
    /// Whether the local end opened this transaction. This client never
    /// accepts peer-opened transactions, but the originator flag is part
    /// of the matching key on the wire.
    pub self_initiated: bool,
    pub kind: TxKind,
    /// Reply messages retained for the caller (streamed and version kinds)
    pub messages: Vec<WireMsg>,
}

impl Transaction {
    pub fn new(token: Token, kind: TxKind) -> Self {
        Self {
            token,
            self_initiated: true,
            kind,
            messages: Vec::new(),
        }
    }

    /// Whether `opcode` is an acceptable next message for this transaction
    pub fn accepts(&self, opcode: Opcode) -> bool {
        match &self.kind {
            TxKind::Handshake(state) => state.expected().contains(&opcode),
            TxKind::Close => opcode.is_close(),
            TxKind::Ack(_) => opcode == Opcode::Reply,
            TxKind::Stream(state) => opcode == state.reply,
            TxKind::CsMulti(_) => opcode == Opcode::CsMultiReply,
            TxKind::VersionQuery => opcode == Opcode::VersionReply,
        }
    }

    /// Session-scoped transactions take the whole session down on failure
    pub fn session_scoped(&self) -> bool {
        matches!(self.kind, TxKind::Handshake(_) | TxKind::Close)
    }

    /// Whether completing this transaction releases the policy-domain slot
    pub fn clears_policy_pending(&self) -> bool {
        match &self.kind {
            TxKind::Stream(_) | TxKind::CsMulti(_) | TxKind::VersionQuery => true,
            TxKind::Ack(_) => self.token == 0,
            TxKind::Handshake(_) | TxKind::Close => false,
        }
    }

    /// Consume the transaction into a caller-visible completion record
    pub fn into_completion(self, result: TxResult) -> Completion {
        let csmulti = match self.kind {
            TxKind::CsMulti(state) => Some(state.request),
            _ => None,
        };
        Completion {
            token: self.token,
            result,
            messages: self.messages,
            csmulti,
        }
    }
}

/// Result of a finished transaction.
///
/// Owns whatever the transaction retained: the accumulated reply
/// messages of a streamed exchange, or the resolved csmulti request.
#[derive(Debug)]
pub struct Completion {
    /// Token of the finished transaction
    pub token: Token,
    /// Terminal result
    pub result: TxResult,
    /// Retained reply messages, in arrival order
    pub messages: Vec<WireMsg>,
    /// The csmulti request, handed back for batched transactions
    pub csmulti: Option<CsMultiRequest>,
}

/// The set of active transactions, keyed by `(token, originator)`
#[derive(Debug, Default)]
pub(crate) struct TransactionSet {
    map: HashMap<(Token, bool), Transaction>,
}

impl TransactionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, token: Token, self_initiated: bool) -> bool {
        self.map.contains_key(&(token, self_initiated))
    }

    /// Register a new transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::TokenInUse`] on a key collision; silently
    /// replacing an active transaction would desynchronize the protocol.
    pub fn insert(&mut self, tx: Transaction) -> Result<(), ClientError> {
        let key = (tx.token, tx.self_initiated);
        if self.map.contains_key(&key) {
            return Err(ClientError::TokenInUse(tx.token));
        }
        self.map.insert(key, tx);
        Ok(())
    }

    /// Remove and return the transaction addressed by the key, if any
    pub fn take(&mut self, token: Token, self_initiated: bool) -> Option<Transaction> {
        self.map.remove(&(token, self_initiated))
    }

    /// Put a transaction back after a non-terminal step
    pub fn reinsert(&mut self, tx: Transaction) {
        self.map.insert((tx.token, tx.self_initiated), tx);
    }

    /// Remove every active transaction (session teardown)
    pub fn drain(&mut self) -> Vec<Transaction> {
        self.map.drain().map(|(_, tx)| tx).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// Result of feeding one message to a transaction
#[derive(Debug)]
pub(crate) enum Outcome {
    /// The transaction consumed the message and expects more
    Continue,
    /// The transaction is finished with the given result
    Done(TxResult),
}
