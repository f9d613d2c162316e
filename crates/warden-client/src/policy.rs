//! Policy-domain requests: streamed exchanges, passphrase delivery and
//! the daemon version query.
//!
//! At most one policy-domain request may be in flight per session; every
//! starter here enforces that synchronously before creating a
//! transaction. Outbound policy payloads are chunked, inbound replies
//! are framed as a START..END message sequence which the transaction
//! accumulates until the END flag (or an error) terminates it.

use crate::channel::Channel;
use crate::error::{ClientError, TxError};
use crate::session::{Session, SessionFlags, SessionState};
use crate::transaction::{AckState, Outcome, StreamState, Token, Transaction, TxKind};
use zeroize::Zeroizing;
use warden_wire::{
    MsgBuilder, Opcode, WireMsg, CSUM_OP_LIST, POLICY_CHUNK, STREAM_END, STREAM_START,
};

/// Advance a single-ack transaction
pub(crate) fn step_ack(state: AckState, msg: &WireMsg) -> Outcome {
    let Ok(ack) = msg.ack() else {
        return Outcome::Done(Err(TxError::Protocol));
    };
    if ack.acked != state.acked {
        tracing::warn!(expected = ?state.acked, got = ?ack.acked, "ack for wrong request");
        return Outcome::Done(Err(TxError::Protocol));
    }
    if ack.error != 0 {
        return Outcome::Done(Err(TxError::Remote(ack.error)));
    }
    Outcome::Done(Ok(()))
}

/// Advance a streamed START..END reply transaction
pub(crate) fn step_stream(
    state: &mut StreamState,
    messages: &mut Vec<WireMsg>,
    msg: WireMsg,
) -> Outcome {
    let chunk = match msg.stream_chunk(state.reply) {
        Ok(chunk) => chunk,
        Err(_) => return Outcome::Done(Err(TxError::Protocol)),
    };

    if chunk.error != 0 {
        return Outcome::Done(Err(TxError::Remote(chunk.error)));
    }

    let start = chunk.flags & STREAM_START != 0;
    let end = chunk.flags & STREAM_END != 0;

    if !state.started {
        if !start {
            tracing::warn!("streamed reply does not begin with a start message");
            return Outcome::Done(Err(TxError::Protocol));
        }
        state.started = true;
    } else if start {
        tracing::warn!("streamed reply restarted mid-stream");
        return Outcome::Done(Err(TxError::Protocol));
    }

    messages.push(msg);

    if end {
        Outcome::Done(Ok(()))
    } else {
        Outcome::Continue
    }
}

/// Advance a version-query transaction
pub(crate) fn step_version(messages: &mut Vec<WireMsg>, msg: WireMsg) -> Outcome {
    let Ok(info) = msg.version_info() else {
        return Outcome::Done(Err(TxError::Protocol));
    };
    let result = if info.error != 0 {
        Err(TxError::Remote(info.error))
    } else {
        Ok(())
    };
    messages.push(msg);
    Outcome::Done(result)
}

/// Concatenate the chunk payloads of an accumulated reply stream
fn concat_stream(messages: &[WireMsg], opcode: Opcode) -> Result<Vec<u8>, ClientError> {
    let mut out = Vec::new();
    for msg in messages {
        out.extend_from_slice(msg.stream_chunk(opcode)?.data);
    }
    Ok(out)
}

impl<C: Channel> Session<C> {
    /// Reserve the single policy-domain request slot
    pub(crate) fn claim_policy_slot(&mut self, token: Token) -> Result<(), ClientError> {
        if self.state != SessionState::Connected {
            return Err(ClientError::InvalidState);
        }
        if self.flags.contains(SessionFlags::POLICY_PENDING) {
            return Err(ClientError::PolicyBusy);
        }
        if self.transactions.contains(token, true) {
            return Err(ClientError::TokenInUse(token));
        }
        Ok(())
    }

    /// Start a policy request.
    ///
    /// The payload is split into `POLICY_CHUNK`-sized request messages,
    /// the first flagged start and the last flagged end; the reply
    /// stream accumulates until its end flag and is handed back through
    /// the transaction's completion.
    ///
    /// # Errors
    ///
    /// Rejects synchronously on a zero token, a busy policy slot, a
    /// token collision, or a session that is not connected; no message
    /// is sent and no transaction is created in those cases.
    pub fn policy_request_start(&mut self, token: Token, payload: &[u8]) -> Result<(), ClientError> {
        if token == 0 {
            return Err(ClientError::InvalidArgument("request token must be nonzero"));
        }
        self.claim_policy_slot(token)?;

        self.transactions.insert(Transaction::new(
            token,
            TxKind::Stream(StreamState {
                reply: Opcode::PolicyReply,
                started: false,
            }),
        ))?;
        self.flags.insert(SessionFlags::POLICY_PENDING);

        let total = payload.len();
        let chunks = payload.chunks(POLICY_CHUNK);
        let last = chunks.len().saturating_sub(1);
        tracing::debug!(token, total, messages = last + 1, "sending policy request");

        if total == 0 {
            let raw = MsgBuilder::new(Opcode::Request)
                .u64(token)
                .u32(STREAM_START | STREAM_END)
                .finish();
            return self.send(&raw);
        }

        for (i, chunk) in chunks.enumerate() {
            let mut flags = 0;
            if i == 0 {
                flags |= STREAM_START;
            }
            if i == last {
                flags |= STREAM_END;
            }
            let raw = MsgBuilder::new(Opcode::Request)
                .u64(token)
                .u32(flags)
                .bytes(chunk)
                .finish();
            self.send(&raw)?;
        }
        Ok(())
    }

    /// Send a policy request and block for the reassembled reply.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::policy_request_start`] rejections and any
    /// failure of the reply stream.
    pub fn policy_request(&mut self, token: Token, payload: &[u8]) -> Result<Vec<u8>, ClientError> {
        self.policy_request_start(token, payload)?;
        let completion = self.wait(token)?;
        completion.result.map_err(ClientError::Op)?;
        concat_stream(&completion.messages, Opcode::PolicyReply)
    }

    /// Start a checksum-list request for a directory.
    ///
    /// # Errors
    ///
    /// Same rejection rules as [`Session::policy_request_start`], plus a
    /// path containing a NUL byte.
    pub fn csum_list_start(&mut self, token: Token, uid: u32, path: &str) -> Result<(), ClientError> {
        if token == 0 {
            return Err(ClientError::InvalidArgument("request token must be nonzero"));
        }
        if path.as_bytes().contains(&0) {
            return Err(ClientError::InvalidArgument("path contains a NUL byte"));
        }
        self.claim_policy_slot(token)?;

        self.transactions.insert(Transaction::new(
            token,
            TxKind::Stream(StreamState {
                reply: Opcode::CsumList,
                started: false,
            }),
        ))?;
        self.flags.insert(SessionFlags::POLICY_PENDING);

        let raw = MsgBuilder::new(Opcode::CsumRequest)
            .u64(token)
            .u32(CSUM_OP_LIST)
            .u32(uid)
            .cstr(path)
            .finish();
        tracing::debug!(token, uid, path, "sending checksum list request");
        self.send(&raw)
    }

    /// Request a checksum listing and block for the reassembled reply.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::csum_list_start`] rejections and any
    /// failure of the reply stream.
    pub fn csum_list(&mut self, token: Token, uid: u32, path: &str) -> Result<Vec<u8>, ClientError> {
        self.csum_list_start(token, uid, path)?;
        let completion = self.wait(token)?;
        completion.result.map_err(ClientError::Op)?;
        concat_stream(&completion.messages, Opcode::CsumList)
    }

    /// Start delivering the key passphrase to the daemon.
    ///
    /// Session-scoped: runs on token 0 and occupies the policy slot. The
    /// outbound message buffer is zeroized after the send.
    ///
    /// # Errors
    ///
    /// Rejects synchronously on a busy policy slot, a NUL byte in the
    /// passphrase, or a session that is not connected.
    pub fn passphrase_start(&mut self, passphrase: &str) -> Result<(), ClientError> {
        if passphrase.as_bytes().contains(&0) {
            return Err(ClientError::InvalidArgument("passphrase contains a NUL byte"));
        }
        self.claim_policy_slot(0)?;

        self.transactions.insert(Transaction::new(
            0,
            TxKind::Ack(AckState {
                acked: Opcode::Passphrase,
            }),
        ))?;
        self.flags.insert(SessionFlags::POLICY_PENDING);

        let raw = Zeroizing::new(
            MsgBuilder::new(Opcode::Passphrase)
                .u64(0)
                .cstr(passphrase)
                .finish(),
        );
        tracing::debug!("delivering passphrase");
        self.send(&raw)
    }

    /// Deliver the key passphrase and block for the daemon's ack.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::passphrase_start`] rejections and any error
    /// the daemon reports in its ack.
    pub fn passphrase(&mut self, passphrase: &str) -> Result<(), ClientError> {
        self.passphrase_start(passphrase)?;
        let completion = self.wait(0)?;
        completion.result.map_err(ClientError::Op)
    }

    /// Start a daemon version query.
    ///
    /// # Errors
    ///
    /// Same rejection rules as [`Session::policy_request_start`].
    pub fn version_start(&mut self, token: Token) -> Result<(), ClientError> {
        if token == 0 {
            return Err(ClientError::InvalidArgument("request token must be nonzero"));
        }
        self.claim_policy_slot(token)?;

        self.transactions
            .insert(Transaction::new(token, TxKind::VersionQuery))?;
        self.flags.insert(SessionFlags::POLICY_PENDING);

        let raw = MsgBuilder::new(Opcode::Version).u64(token).finish();
        self.send(&raw)
    }

    /// Query the daemon's protocol and policy-language versions.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::version_start`] rejections and any error
    /// the daemon reports.
    pub fn version(&mut self, token: Token) -> Result<(u32, u32), ClientError> {
        self.version_start(token)?;
        let completion = self.wait(token)?;
        completion.result.map_err(ClientError::Op)?;
        let info = completion
            .messages
            .first()
            .ok_or(ClientError::Violation("version reply was not retained"))?
            .version_info()?;
        Ok((info.protocol, info.policy_lang))
    }
}
