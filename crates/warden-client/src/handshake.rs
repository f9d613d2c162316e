//! Connect handshake orchestration.
//!
//! The handshake is a single token-0 transaction with six strictly
//! ordered stages: greeting/version selection, version ack,
//! authentication announcement, the auth data exchange (which may loop),
//! option negotiation and sub-protocol selection. Each stage consumes
//! exactly one inbound message and produces exactly one outbound
//! message, except the auth exchange which repeats until the server
//! delivers its verdict.

use crate::channel::Channel;
use crate::error::{ClientError, TxError};
use crate::session::{AuthType, ProtocolSet, Session, SessionFlags, SessionState};
use crate::transaction::{Outcome, Transaction, TxKind};
use warden_wire::{
    MsgBuilder, Opcode, WireMsg, PROTOCOL_MIN_VERSION, PROTOCOL_VERSION, PROTOCOL_VERSION_LEGACY,
};

/// Option names offered during negotiation
const OPT_MULTIPLEX: &str = "MULTIPLEX";
const OPT_PIPELINE: &str = "PIPELINE";

/// Sub-protocol names used in the selection message
const PROTO_POLICY: &str = "POLICY";
const PROTO_NOTIFY: &str = "NOTIFY";

/// Handshake progress
#[derive(Debug, Clone, Copy)]
pub(crate) struct HandshakeState {
    stage: Stage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Awaiting the server greeting
    Hello,
    /// Awaiting the ack for our version selection
    VerSelAck,
    /// Awaiting the ack for our auth announcement
    AuthAck,
    /// Awaiting auth challenges or the auth verdict
    AuthExchange,
    /// Awaiting the accepted option subset
    OptAck,
    /// Awaiting the ack for our sub-protocol selection
    ProtoAck,
}

impl HandshakeState {
    pub fn new() -> Self {
        Self {
            stage: Stage::Hello,
        }
    }

    /// Acceptable opcodes for the current stage
    pub fn expected(&self) -> &'static [Opcode] {
        match self.stage {
            Stage::Hello => &[Opcode::Hello],
            Stage::VerSelAck | Stage::AuthAck | Stage::ProtoAck => &[Opcode::Reply],
            Stage::AuthExchange => &[Opcode::AuthData, Opcode::AuthReply],
            Stage::OptAck => &[Opcode::OptAck],
        }
    }
}

/// Pick the protocol version for a session.
///
/// Prefers this client's native version if the server accepts it, else
/// falls back to the highest version inside both the client's and the
/// server's supported ranges. Returns `None` when the ranges do not
/// overlap (a hard negotiation failure).
#[must_use]
pub fn select_version(server_min: u32, server_version: u32) -> Option<u32> {
    if server_min > server_version {
        return None;
    }
    if (server_min..=server_version).contains(&PROTOCOL_VERSION) {
        return Some(PROTOCOL_VERSION);
    }
    let hi = PROTOCOL_VERSION.min(server_version);
    let lo = PROTOCOL_MIN_VERSION.max(server_min);
    (lo <= hi).then_some(hi)
}

/// Validate a token-0 handshake ack for the given request opcode
fn check_ack(msg: &WireMsg, acked: Opcode) -> Result<(), TxError> {
    let ack = msg.ack().map_err(|_| TxError::Protocol)?;
    if ack.token != 0 || ack.acked != acked {
        return Err(TxError::Protocol);
    }
    if ack.error != 0 {
        return Err(TxError::Remote(ack.error));
    }
    Ok(())
}

impl<C: Channel> Session<C> {
    /// Start the connect handshake for the given sub-protocol set.
    ///
    /// The session moves to `Connecting`; drive it with
    /// [`Session::process`]/[`Session::pump`] or block in
    /// [`Session::connect`].
    ///
    /// # Errors
    ///
    /// Rejects synchronously if the session is past `Init`, the protocol
    /// set is empty or names unknown protocols, or key authentication
    /// was configured without installing an auth handler.
    pub fn connect_start(&mut self, protocols: ProtocolSet) -> Result<(), ClientError> {
        if self.state != SessionState::Init {
            return Err(ClientError::InvalidState);
        }
        if protocols.is_empty() {
            return Err(ClientError::InvalidArgument("requested protocol set is empty"));
        }
        if protocols.has_unknown_bits() {
            return Err(ClientError::InvalidArgument(
                "requested protocol set names unknown protocols",
            ));
        }
        if self.auth_type == AuthType::TransportAndKey && self.auth.is_none() {
            return Err(ClientError::InvalidArgument(
                "key authentication requires an auth handler",
            ));
        }

        self.requested = protocols;
        self.transactions
            .insert(Transaction::new(0, TxKind::Handshake(HandshakeState::new())))?;
        self.state = SessionState::Connecting;
        tracing::debug!(?protocols, "starting connect handshake");
        Ok(())
    }

    /// Run the connect handshake to completion, blocking on the channel.
    ///
    /// # Errors
    ///
    /// Propagates [`Session::connect_start`] rejections and any
    /// handshake failure; the session is in the `Error` state after a
    /// failed handshake.
    pub fn connect(&mut self, protocols: ProtocolSet) -> Result<(), ClientError> {
        self.connect_start(protocols)?;
        let completion = self.wait(0)?;
        completion.result.map_err(ClientError::Op)
    }

    pub(crate) fn step_handshake(
        &mut self,
        state: &mut HandshakeState,
        msg: &WireMsg,
    ) -> Result<Outcome, ClientError> {
        match state.stage {
            Stage::Hello => {
                let Ok(hello) = msg.hello() else {
                    return Ok(Outcome::Done(Err(TxError::Protocol)));
                };
                self.server_min_version = hello.min_version;
                self.server_version = hello.version;

                let Some(version) = select_version(hello.min_version, hello.version) else {
                    tracing::warn!(
                        server_min = hello.min_version,
                        server_version = hello.version,
                        "no mutually supported protocol version"
                    );
                    return Ok(Outcome::Done(Err(TxError::NotSupported)));
                };
                self.selected_version = version;

                if version == PROTOCOL_VERSION_LEGACY {
                    if self.auth.take().is_some() || self.auth_type != AuthType::Transport {
                        tracing::debug!("legacy peer, falling back to transport authentication");
                    }
                    self.auth_type = AuthType::Transport;
                }

                tracing::debug!(version, "selected protocol version");
                let raw = MsgBuilder::new(Opcode::VerSel).u32(version).finish();
                self.send(&raw)?;
                state.stage = Stage::VerSelAck;
                Ok(Outcome::Continue)
            }

            Stage::VerSelAck => {
                if let Err(err) = check_ack(msg, Opcode::VerSel) {
                    return Ok(Outcome::Done(Err(err)));
                }
                let raw = MsgBuilder::new(Opcode::Auth)
                    .u32(self.auth_type as u32)
                    .finish();
                self.send(&raw)?;
                state.stage = Stage::AuthAck;
                Ok(Outcome::Continue)
            }

            Stage::AuthAck => {
                if let Err(err) = check_ack(msg, Opcode::Auth) {
                    return Ok(Outcome::Done(Err(err)));
                }
                let raw = MsgBuilder::new(Opcode::AuthData)
                    .u32(self.auth_type as u32)
                    .finish();
                self.send(&raw)?;
                state.stage = Stage::AuthExchange;
                Ok(Outcome::Continue)
            }

            Stage::AuthExchange => match msg.opcode() {
                Opcode::AuthData => {
                    let response = match self.auth.as_mut() {
                        Some(handler) => match handler.respond(msg) {
                            Ok(response) => response,
                            Err(err) => {
                                tracing::warn!(%err, "auth handler rejected challenge");
                                return Ok(Outcome::Done(Err(TxError::Protocol)));
                            }
                        },
                        None => {
                            tracing::warn!("auth challenge received without an auth handler");
                            return Ok(Outcome::Done(Err(TxError::Protocol)));
                        }
                    };
                    let raw = MsgBuilder::new(Opcode::AuthData)
                        .u32(self.auth_type as u32)
                        .bytes(&response)
                        .finish();
                    self.send(&raw)?;
                    // The exchange repeats until the server sends its verdict.
                    Ok(Outcome::Continue)
                }
                Opcode::AuthReply => {
                    let Ok(reply) = msg.auth_reply() else {
                        return Ok(Outcome::Done(Err(TxError::Protocol)));
                    };
                    if reply.error != 0 {
                        tracing::warn!(error = reply.error, "authentication rejected");
                        return Ok(Outcome::Done(Err(TxError::Remote(reply.error))));
                    }
                    self.auth_uid = reply.uid;
                    let raw = MsgBuilder::new(Opcode::OptReq)
                        .cstr(OPT_MULTIPLEX)
                        .cstr(OPT_PIPELINE)
                        .finish();
                    self.send(&raw)?;
                    state.stage = Stage::OptAck;
                    Ok(Outcome::Continue)
                }
                _ => Ok(Outcome::Done(Err(TxError::Protocol))),
            },

            Stage::OptAck => {
                let Ok(accepted) = msg.string_list() else {
                    return Ok(Outcome::Done(Err(TxError::Protocol)));
                };
                for option in accepted {
                    match option {
                        OPT_MULTIPLEX => self.flags.insert(SessionFlags::MULTIPLEX),
                        OPT_PIPELINE => self.flags.insert(SessionFlags::PIPELINE),
                        other => tracing::debug!(option = other, "ignoring unknown accepted option"),
                    }
                }
                let both = ProtocolSet::POLICY | ProtocolSet::NOTIFY;
                if self.requested.contains(both) && !self.flags.contains(SessionFlags::MULTIPLEX) {
                    tracing::warn!("peer refused multiplexing but both sub-protocols requested");
                    return Ok(Outcome::Done(Err(TxError::NotSupported)));
                }

                let mut builder = MsgBuilder::new(Opcode::ProtoSel);
                if self.requested.contains(ProtocolSet::POLICY) {
                    builder = builder.cstr(PROTO_POLICY);
                }
                if self.requested.contains(ProtocolSet::NOTIFY) {
                    builder = builder.cstr(PROTO_NOTIFY);
                }
                self.send(&builder.finish())?;
                state.stage = Stage::ProtoAck;
                Ok(Outcome::Continue)
            }

            Stage::ProtoAck => {
                if let Err(err) = check_ack(msg, Opcode::ProtoSel) {
                    return Ok(Outcome::Done(Err(err)));
                }
                self.set_protocols(self.requested);
                self.state = SessionState::Connected;
                tracing::debug!(
                    version = self.selected_version,
                    uid = self.auth_uid,
                    "session established"
                );
                Ok(Outcome::Done(Ok(())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::ScriptChannel;
    use crate::session::SessionConfig;
    use crate::testutil::{ack, auth_reply, hello, opt_ack};

    fn session() -> Session<ScriptChannel> {
        Session::new(ScriptChannel::new(), SessionConfig::default())
    }

    #[test]
    fn test_select_version_prefers_native() {
        assert_eq!(select_version(3, 7), Some(PROTOCOL_VERSION));
        assert_eq!(select_version(7, 9), Some(PROTOCOL_VERSION));
        assert_eq!(select_version(1, 8), Some(PROTOCOL_VERSION));
    }

    #[test]
    fn test_select_version_falls_back() {
        // Server tops out below our native version
        assert_eq!(select_version(2, 5), Some(5));
        assert_eq!(select_version(3, 3), Some(3));
        assert_eq!(select_version(1, 4), Some(4));
    }

    #[test]
    fn test_select_version_no_overlap() {
        // Server only speaks newer versions than we do
        assert_eq!(select_version(8, 9), None);
        // Server only speaks versions older than our minimum
        assert_eq!(select_version(1, 2), None);
        // Nonsensical server range
        assert_eq!(select_version(6, 4), None);
    }

    #[test]
    fn test_connect_start_rejects_bad_protocol_sets() {
        let mut s = session();
        assert!(matches!(
            s.connect_start(ProtocolSet::empty()),
            Err(ClientError::InvalidArgument(_))
        ));
        assert_eq!(s.state(), SessionState::Init);
    }

    #[test]
    fn test_connect_start_rejects_restart() {
        let mut s = session();
        s.connect_start(ProtocolSet::POLICY).unwrap();
        assert!(matches!(
            s.connect_start(ProtocolSet::POLICY),
            Err(ClientError::InvalidState)
        ));
    }

    #[test]
    fn test_full_handshake() {
        let mut s = session();
        s.connect_start(ProtocolSet::POLICY | ProtocolSet::NOTIFY).unwrap();
        assert_eq!(s.state(), SessionState::Connecting);

        s.process(hello(3, 7)).unwrap();
        s.process(ack(0, Opcode::VerSel, 0)).unwrap();
        s.process(ack(0, Opcode::Auth, 0)).unwrap();
        s.process(auth_reply(0, 1000)).unwrap();
        s.process(opt_ack(&["MULTIPLEX", "PIPELINE"])).unwrap();
        s.process(ack(0, Opcode::ProtoSel, 0)).unwrap();

        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(s.selected_version(), 7);
        assert_eq!(s.auth_uid(), 1000);
        assert!(s.flags().contains(SessionFlags::MULTIPLEX));
        assert!(s.protocols().contains(ProtocolSet::POLICY));
        assert!(s.protocols().contains(ProtocolSet::NOTIFY));

        let completion = s.take_completion(0).unwrap();
        assert!(completion.result.is_ok());

        // Outbound sequence: VerSel, Auth, AuthData, OptReq, ProtoSel
        assert_eq!(s.chan.sent.len(), 5);
    }

    #[test]
    fn test_handshake_wrong_opcode_is_fatal() {
        let mut s = session();
        s.connect_start(ProtocolSet::POLICY).unwrap();
        // OptAck instead of the expected Hello
        let err = s.process(opt_ack(&["MULTIPLEX"])).unwrap_err();
        assert!(matches!(err, ClientError::Violation(_)));
        assert_eq!(s.state(), SessionState::Error);
        let completion = s.take_completion(0).unwrap();
        assert_eq!(completion.result, Err(TxError::Protocol));
    }

    #[test]
    fn test_handshake_version_mismatch() {
        let mut s = session();
        s.connect_start(ProtocolSet::POLICY).unwrap();
        let err = s.process(hello(8, 9)).unwrap_err();
        assert!(matches!(err, ClientError::Op(TxError::NotSupported)));
        assert_eq!(s.state(), SessionState::Error);
        assert!(s.chan.closed);
    }

    #[test]
    fn test_handshake_auth_rejected() {
        let mut s = session();
        s.connect_start(ProtocolSet::POLICY).unwrap();
        s.process(hello(3, 7)).unwrap();
        s.process(ack(0, Opcode::VerSel, 0)).unwrap();
        s.process(ack(0, Opcode::Auth, 0)).unwrap();
        let err = s.process(auth_reply(13, 0)).unwrap_err();
        assert!(matches!(err, ClientError::Op(TxError::Remote(13))));
        assert_eq!(s.state(), SessionState::Error);
    }

    #[test]
    fn test_handshake_multiplex_required_for_both_protocols() {
        let mut s = session();
        s.connect_start(ProtocolSet::POLICY | ProtocolSet::NOTIFY).unwrap();
        s.process(hello(3, 7)).unwrap();
        s.process(ack(0, Opcode::VerSel, 0)).unwrap();
        s.process(ack(0, Opcode::Auth, 0)).unwrap();
        s.process(auth_reply(0, 1000)).unwrap();
        let err = s.process(opt_ack(&["PIPELINE"])).unwrap_err();
        assert!(matches!(err, ClientError::Op(TxError::NotSupported)));
        assert_eq!(s.state(), SessionState::Error);
    }

    #[test]
    fn test_handshake_single_protocol_without_multiplex() {
        let mut s = session();
        s.connect_start(ProtocolSet::POLICY).unwrap();
        s.process(hello(3, 7)).unwrap();
        s.process(ack(0, Opcode::VerSel, 0)).unwrap();
        s.process(ack(0, Opcode::Auth, 0)).unwrap();
        s.process(auth_reply(0, 1000)).unwrap();
        s.process(opt_ack(&[])).unwrap();
        s.process(ack(0, Opcode::ProtoSel, 0)).unwrap();
        assert_eq!(s.state(), SessionState::Connected);
        assert!(!s.flags().contains(SessionFlags::MULTIPLEX));
    }

    struct CountingHandler {
        calls: std::rc::Rc<std::cell::Cell<usize>>,
    }

    impl crate::session::AuthHandler for CountingHandler {
        fn respond(&mut self, _challenge: &WireMsg) -> Result<Vec<u8>, ClientError> {
            self.calls.set(self.calls.get() + 1);
            Ok(vec![0xAB; 16])
        }
    }

    #[test]
    fn test_handshake_auth_challenge_loop() {
        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut s = Session::new(
            ScriptChannel::new(),
            SessionConfig {
                auth_type: AuthType::TransportAndKey,
            },
        );
        s.set_auth_handler(Box::new(CountingHandler {
            calls: calls.clone(),
        }));

        s.connect_start(ProtocolSet::POLICY).unwrap();
        s.process(hello(3, 7)).unwrap();
        s.process(ack(0, Opcode::VerSel, 0)).unwrap();
        s.process(ack(0, Opcode::Auth, 0)).unwrap();

        // Two challenges before the verdict; the stage must not advance.
        let challenge = MsgBuilder::new(Opcode::AuthData)
            .u32(AuthType::TransportAndKey as u32)
            .bytes(b"challenge")
            .finish();
        s.process(challenge.clone()).unwrap();
        s.process(challenge).unwrap();
        assert_eq!(calls.get(), 2);

        s.process(auth_reply(0, 55)).unwrap();
        s.process(opt_ack(&["MULTIPLEX"])).unwrap();
        s.process(ack(0, Opcode::ProtoSel, 0)).unwrap();
        assert_eq!(s.state(), SessionState::Connected);
        assert_eq!(s.auth_uid(), 55);
    }

    #[test]
    fn test_handshake_challenge_without_handler_is_fatal() {
        let mut s = session();
        s.connect_start(ProtocolSet::POLICY).unwrap();
        s.process(hello(3, 7)).unwrap();
        s.process(ack(0, Opcode::VerSel, 0)).unwrap();
        s.process(ack(0, Opcode::Auth, 0)).unwrap();
        let challenge = MsgBuilder::new(Opcode::AuthData).u32(0).finish();
        let err = s.process(challenge).unwrap_err();
        assert!(matches!(err, ClientError::Op(TxError::Protocol)));
        assert_eq!(s.state(), SessionState::Error);
    }

    #[test]
    fn test_legacy_version_disables_key_auth() {
        let calls = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut s = Session::new(
            ScriptChannel::new(),
            SessionConfig {
                auth_type: AuthType::TransportAndKey,
            },
        );
        s.set_auth_handler(Box::new(CountingHandler {
            calls: calls.clone(),
        }));
        s.connect_start(ProtocolSet::POLICY).unwrap();

        // Server only speaks the legacy version
        s.process(hello(2, 3)).unwrap();
        assert_eq!(s.selected_version(), PROTOCOL_VERSION_LEGACY);

        // The Auth announcement after the VerSel ack must be transport-only
        s.process(ack(0, Opcode::VerSel, 0)).unwrap();
        let auth_msg = WireMsg::verify(s.chan.sent[1].clone()).unwrap();
        assert_eq!(auth_msg.opcode(), Opcode::Auth);
        assert_eq!(
            u32::from_be_bytes(auth_msg.payload()[0..4].try_into().unwrap()),
            AuthType::Transport as u32
        );
    }

    #[test]
    fn test_key_auth_requires_handler() {
        let mut s = Session::new(
            ScriptChannel::new(),
            SessionConfig {
                auth_type: AuthType::TransportAndKey,
            },
        );
        assert!(matches!(
            s.connect_start(ProtocolSet::POLICY),
            Err(ClientError::InvalidArgument(_))
        ));
    }
}
