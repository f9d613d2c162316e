//! Notification delivery and registration.
//!
//! Asynchronous event messages pushed by the server are queued in
//! arrival order and drained by the caller without blocking; see
//! [`Session::next_notification`]. This module adds the client-to-server
//! half: registering and unregistering for delivery, and answering or
//! delegating `Ask` verdicts.

use crate::channel::Channel;
use crate::error::ClientError;
use crate::session::{Session, SessionFlags, SessionState};
use crate::transaction::{AckState, Token, Transaction, TxKind};
use warden_wire::{MsgBuilder, Opcode};

impl<C: Channel> Session<C> {
    fn check_notify_send(&self) -> Result<(), ClientError> {
        if !matches!(self.state, SessionState::Connected | SessionState::Closing) {
            return Err(ClientError::InvalidState);
        }
        // Once our close acknowledgment is out, nothing may follow it.
        if self.flags.contains(SessionFlags::SENT_CLOSEACK) {
            return Err(ClientError::InvalidState);
        }
        Ok(())
    }

    /// Answer an `Ask` notification with a verdict.
    ///
    /// `error` 0 allows the asked operation, any other value denies it
    /// with that code.
    ///
    /// # Errors
    ///
    /// Rejects synchronously once the close handshake has progressed to
    /// our acknowledgment, or when the session is not connected.
    pub fn answer(&mut self, token: Token, error: u32) -> Result<(), ClientError> {
        self.check_notify_send()?;
        let raw = MsgBuilder::new(Opcode::Reply)
            .u64(token)
            .u32(Opcode::Ask as u32)
            .u32(error)
            .finish();
        self.send(&raw)
    }

    /// Delegate an `Ask` verdict to another registration.
    ///
    /// # Errors
    ///
    /// Same rejection rules as [`Session::answer`].
    pub fn delegate(&mut self, token: Token, uid: u32, error: u32) -> Result<(), ClientError> {
        self.check_notify_send()?;
        let raw = MsgBuilder::new(Opcode::Delegate)
            .u64(token)
            .u32(Opcode::Ask as u32)
            .u32(uid)
            .u32(error)
            .finish();
        self.send(&raw)
    }

    fn notify_reg_start(
        &mut self,
        opcode: Opcode,
        token: Token,
        uid: u32,
        rule_id: u32,
        subsystem: u32,
    ) -> Result<(), ClientError> {
        if self.state != SessionState::Connected {
            return Err(ClientError::InvalidState);
        }
        if token == 0 {
            return Err(ClientError::InvalidArgument("registration token must be nonzero"));
        }

        self.transactions.insert(Transaction::new(
            token,
            TxKind::Ack(AckState { acked: opcode }),
        ))?;
        let raw = MsgBuilder::new(opcode)
            .u64(token)
            .u32(uid)
            .u32(rule_id)
            .u32(subsystem)
            .finish();
        tracing::debug!(?opcode, token, uid, rule_id, subsystem, "notify registration");
        self.send(&raw)
    }

    /// Start registering for notification delivery.
    ///
    /// # Errors
    ///
    /// Rejects synchronously on a zero token, a token collision, or a
    /// session that is not connected.
    pub fn register_start(
        &mut self,
        token: Token,
        uid: u32,
        rule_id: u32,
        subsystem: u32,
    ) -> Result<(), ClientError> {
        self.notify_reg_start(Opcode::Register, token, uid, rule_id, subsystem)
    }

    /// Register for notification delivery, blocking until acknowledged.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::register_start`] rejections and any error
    /// the server reports in its ack.
    pub fn register(
        &mut self,
        token: Token,
        uid: u32,
        rule_id: u32,
        subsystem: u32,
    ) -> Result<(), ClientError> {
        self.register_start(token, uid, rule_id, subsystem)?;
        let completion = self.wait(token)?;
        completion.result.map_err(ClientError::Op)
    }

    /// Start unregistering from notification delivery.
    ///
    /// # Errors
    ///
    /// Same rejection rules as [`Session::register_start`].
    pub fn unregister_start(
        &mut self,
        token: Token,
        uid: u32,
        rule_id: u32,
        subsystem: u32,
    ) -> Result<(), ClientError> {
        self.notify_reg_start(Opcode::Unregister, token, uid, rule_id, subsystem)
    }

    /// Unregister from notification delivery, blocking until acknowledged.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::unregister_start`] rejections and any error
    /// the server reports in its ack.
    pub fn unregister(
        &mut self,
        token: Token,
        uid: u32,
        rule_id: u32,
        subsystem: u32,
    ) -> Result<(), ClientError> {
        self.unregister_start(token, uid, rule_id, subsystem)?;
        let completion = self.wait(token)?;
        completion.result.map_err(ClientError::Op)
    }
}
