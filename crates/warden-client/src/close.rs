//! Symmetric close handshake.
//!
//! Either side may request a close; the channel is only quiescent once
//! both sides have sent and received an acknowledgment. The session
//! tracks the four flags (sent/got x req/ack) and the transaction's step
//! logic re-evaluates them on every close message, so any interleaving
//! of the peer's CloseReq/CloseAck arrives at the same end state.

use crate::channel::Channel;
use crate::error::{ClientError, TxError};
use crate::session::{Session, SessionFlags, SessionState};
use crate::transaction::{Outcome, Transaction, TxKind};
use warden_wire::{MsgBuilder, Opcode, WireMsg};

impl<C: Channel> Session<C> {
    /// Start the close handshake.
    ///
    /// Sends our CloseReq and registers the token-0 close transaction.
    /// Drive it with [`Session::process`]/[`Session::pump`] or block in
    /// [`Session::close`].
    ///
    /// # Errors
    ///
    /// Rejects synchronously if a close request was already sent or the
    /// session is not in a connected state.
    pub fn close_start(&mut self) -> Result<(), ClientError> {
        if self.flags.contains(SessionFlags::SENT_CLOSEREQ) {
            return Err(ClientError::InvalidState);
        }
        if !matches!(self.state, SessionState::Connected | SessionState::Closing) {
            return Err(ClientError::InvalidState);
        }

        self.transactions.insert(Transaction::new(0, TxKind::Close))?;
        self.send(&MsgBuilder::new(Opcode::CloseReq).finish())?;
        self.flags.insert(SessionFlags::SENT_CLOSEREQ);
        self.state = SessionState::Closing;
        tracing::debug!("close handshake started");
        Ok(())
    }

    /// Run the close handshake to completion, blocking on the channel.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::close_start`] rejections and any protocol
    /// violation during the handshake.
    pub fn close(&mut self) -> Result<(), ClientError> {
        self.close_start()?;
        let completion = self.wait(0)?;
        completion.result.map_err(ClientError::Op)
    }

    pub(crate) fn step_close(&mut self, msg: &WireMsg) -> Result<Outcome, ClientError> {
        // The pre-dispatch scan already recorded these; setting them
        // again keeps the step correct even if it is ever driven
        // directly.
        match msg.opcode() {
            Opcode::CloseReq => self.flags.insert(SessionFlags::GOT_CLOSEREQ),
            Opcode::CloseAck => self.flags.insert(SessionFlags::GOT_CLOSEACK),
            _ => return Ok(Outcome::Done(Err(TxError::Protocol))),
        }

        // This transaction only exists after our own request went out.
        if !self.flags.contains(SessionFlags::SENT_CLOSEREQ) {
            return Ok(Outcome::Done(Err(TxError::Protocol)));
        }

        // The peer must not acknowledge a close before requesting one.
        if self.flags.contains(SessionFlags::GOT_CLOSEACK)
            && !self.flags.contains(SessionFlags::GOT_CLOSEREQ)
        {
            tracing::warn!("peer acknowledged close before requesting it");
            return Ok(Outcome::Done(Err(TxError::Protocol)));
        }

        if self.flags.contains(SessionFlags::GOT_CLOSEREQ)
            && !self.flags.contains(SessionFlags::SENT_CLOSEACK)
        {
            self.send(&MsgBuilder::new(Opcode::CloseAck).finish())?;
            self.flags.insert(SessionFlags::SENT_CLOSEACK);
        }

        if self.flags.contains(SessionFlags::GOT_CLOSEACK)
            && self.flags.contains(SessionFlags::SENT_CLOSEACK)
        {
            if let Err(err) = self.chan.close() {
                tracing::debug!(%err, "channel close failed");
            }
            self.state = SessionState::Closed;
            tracing::debug!("session closed");
            return Ok(Outcome::Done(Ok(())));
        }

        Ok(Outcome::Continue)
    }
}
