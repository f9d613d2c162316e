//! End-to-end session flows over a scripted channel.

mod common;

use common::{
    ack, connected_session, handshake_script, hello, init_tracing, stream_reply, ScriptChannel,
};
use warden_client::wire::{MsgBuilder, Opcode, STREAM_END, STREAM_START};
use warden_client::{
    ClientError, CsKind, CsMultiOp, CsMultiRequest, ProtocolSet, Session, SessionConfig,
    SessionState, TxError,
};

fn sent_opcodes(session: &Session<ScriptChannel>) -> Vec<Opcode> {
    session
        .channel()
        .sent
        .iter()
        .map(|raw| {
            warden_client::wire::WireMsg::verify(raw.clone())
                .unwrap()
                .opcode()
        })
        .collect()
}

#[test]
fn blocking_connect_completes_handshake() {
    init_tracing();
    let mut chan = ScriptChannel::new();
    for raw in handshake_script(501) {
        chan.push(raw);
    }
    let mut session = Session::new(chan, SessionConfig::default());
    session
        .connect(ProtocolSet::POLICY | ProtocolSet::NOTIFY)
        .unwrap();

    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.auth_uid(), 501);
    assert_eq!(session.selected_version(), 7);
    assert_eq!(
        sent_opcodes(&session),
        vec![
            Opcode::VerSel,
            Opcode::Auth,
            Opcode::AuthData,
            Opcode::OptReq,
            Opcode::ProtoSel,
        ]
    );
}

#[test]
fn blocking_connect_fails_on_version_mismatch() {
    let mut chan = ScriptChannel::new();
    chan.push(hello(9, 12));
    let mut session = Session::new(chan, SessionConfig::default());
    let err = session.connect(ProtocolSet::POLICY).unwrap_err();
    assert!(matches!(err, ClientError::Op(TxError::NotSupported)));
    assert_eq!(session.state(), SessionState::Error);
    assert!(session.channel().closed);
}

#[test]
fn close_scenario_server_echoes_req_then_ack() {
    // Client in Connected sends CloseReq; the server immediately echoes
    // CloseReq then CloseAck. Expected end state: Closed, with exactly
    // one CloseAck sent by the client.
    init_tracing();
    let mut session = connected_session(ProtocolSet::POLICY);
    session
        .channel_mut()
        .push(MsgBuilder::new(Opcode::CloseReq).finish());
    session
        .channel_mut()
        .push(MsgBuilder::new(Opcode::CloseAck).finish());

    session.close().unwrap();

    assert_eq!(session.state(), SessionState::Closed);
    assert!(session.channel().closed);
    let close_acks = sent_opcodes(&session)
        .iter()
        .filter(|op| **op == Opcode::CloseAck)
        .count();
    assert_eq!(close_acks, 1);
}

#[test]
fn close_ack_before_req_moves_session_to_error() {
    let mut session = connected_session(ProtocolSet::POLICY);
    session
        .channel_mut()
        .push(MsgBuilder::new(Opcode::CloseAck).finish());

    let err = session.close().unwrap_err();
    assert!(matches!(err, ClientError::Op(TxError::Protocol)));
    assert_eq!(session.state(), SessionState::Error);
}

#[test]
fn notify_register_ask_answer_flow() {
    let mut session = connected_session(ProtocolSet::NOTIFY);

    session.channel_mut().push(ack(40, Opcode::Register, 0));
    session.register(40, 1000, 0, 1).unwrap();

    // Server pushes an ask; the caller answers it by token.
    let ask = MsgBuilder::new(Opcode::Ask)
        .u64(900)
        .u32(1234)
        .u32(1000)
        .u32(1)
        .bytes(b"/sbin/init")
        .finish();
    session.process(ask).unwrap();

    let event = session.next_notification().unwrap();
    assert_eq!(event.opcode(), Opcode::Ask);
    session.answer(event.token().unwrap(), 0).unwrap();

    let last = session.channel().sent.last().unwrap().clone();
    let verdict = warden_client::wire::WireMsg::verify(last).unwrap();
    let fields = verdict.ack().unwrap();
    assert_eq!(fields.token, 900);
    assert_eq!(fields.acked, Opcode::Ask);
    assert_eq!(fields.error, 0);

    session.channel_mut().push(ack(40, Opcode::Unregister, 0));
    session.unregister(40, 1000, 0, 1).unwrap();
}

#[test]
fn second_policy_request_rejected_while_pending() {
    // Literal sequence: start csum-list request, attempt policy-request
    // start, expect rejection with no message sent and no transaction
    // created.
    let mut session = connected_session(ProtocolSet::POLICY);
    session.csum_list_start(60, 1000, "/etc").unwrap();

    let sent_before = session.channel().sent.len();
    let active_before = session.active_transactions();
    assert!(matches!(
        session.policy_request_start(61, b"payload"),
        Err(ClientError::PolicyBusy)
    ));
    assert_eq!(session.channel().sent.len(), sent_before);
    assert_eq!(session.active_transactions(), active_before);
}

#[test]
fn policy_request_reassembles_streamed_reply() {
    let mut session = connected_session(ProtocolSet::POLICY);
    session
        .channel_mut()
        .push(stream_reply(Opcode::PolicyReply, 70, STREAM_START, 0, b"alpha "));
    session
        .channel_mut()
        .push(stream_reply(Opcode::PolicyReply, 70, 0, 0, b"beta "));
    session
        .channel_mut()
        .push(stream_reply(Opcode::PolicyReply, 70, STREAM_END, 0, b"gamma"));

    let reply = session.policy_request(70, b"show rules").unwrap();
    assert_eq!(reply, b"alpha beta gamma");
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn streamed_reply_without_start_flag_fails() {
    let mut session = connected_session(ProtocolSet::POLICY);
    session
        .channel_mut()
        .push(stream_reply(Opcode::PolicyReply, 70, 0, 0, b"no start"));

    let err = session.policy_request(70, b"q").unwrap_err();
    assert!(matches!(err, ClientError::Op(TxError::Protocol)));
    // Content-scoped failure: the session itself survives.
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn csum_list_uses_its_own_stream_opcode() {
    let mut session = connected_session(ProtocolSet::POLICY);
    session.channel_mut().push(stream_reply(
        Opcode::CsumList,
        80,
        STREAM_START | STREAM_END,
        0,
        b"/etc/passwd\0/etc/shadow\0",
    ));

    let listing = session.csum_list(80, 1000, "/etc").unwrap();
    assert_eq!(listing, b"/etc/passwd\0/etc/shadow\0");
}

/// Build a csmulti reply from (index, error, get-payload) triples
fn csmulti_reply(token: u64, op: CsMultiOp, records: &[(u32, u32, Vec<u8>)]) -> Vec<u8> {
    let mut builder = MsgBuilder::new(Opcode::CsMultiReply)
        .u64(token)
        .u32(op as u32)
        .u32(0);
    for (index, error, payload) in records {
        let len = (12 + payload.len() + 3) & !3;
        builder = builder
            .u32(len as u32)
            .u32(*index)
            .u32(*error)
            .bytes(payload);
        for _ in 0..len - 12 - payload.len() {
            builder = builder.bytes(&[0]);
        }
    }
    builder.u32(0).finish()
}

fn get_payload(checksum: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&(CsKind::Checksum as u32).to_be_bytes());
    out.extend_from_slice(&(checksum.len() as u32).to_be_bytes());
    out.extend_from_slice(checksum);
    out.extend_from_slice(&0u32.to_be_bytes());
    out
}

#[test]
fn csmulti_resumes_until_all_records_resolved() {
    init_tracing();
    let mut session = connected_session(ProtocolSet::POLICY);

    let mut request = CsMultiRequest::new(CsMultiOp::GetChecksum, 1000, None).unwrap();
    for path in ["/bin/sh", "/bin/ls", "/bin/cat"] {
        request.add_path(path).unwrap();
    }

    // First reply covers records 0 and 2; the follow-up request covers 1.
    session.channel_mut().push(csmulti_reply(
        90,
        CsMultiOp::GetChecksum,
        &[
            (0, 0, get_payload(&[0xAA; 32])),
            (2, 0, get_payload(&[0xCC; 32])),
        ],
    ));
    session.channel_mut().push(csmulti_reply(
        90,
        CsMultiOp::GetChecksum,
        &[(1, 0, get_payload(&[0xBB; 32]))],
    ));

    let request = session.csmulti(90, request).unwrap();
    assert!(request.is_complete());
    assert_eq!(request.entry(0, CsKind::Checksum).unwrap(), &[0xAA; 32]);
    assert_eq!(request.entry(1, CsKind::Checksum).unwrap(), &[0xBB; 32]);
    assert_eq!(request.entry(2, CsKind::Checksum).unwrap(), &[0xCC; 32]);

    // Two request messages went out in total.
    let requests = sent_opcodes(&session)
        .iter()
        .filter(|op| **op == Opcode::CsMultiRequest)
        .count();
    assert_eq!(requests, 2);
}

#[test]
fn csmulti_truncated_reply_is_protocol_error() {
    let mut session = connected_session(ProtocolSet::POLICY);

    let mut request = CsMultiRequest::new(CsMultiOp::DelChecksum, 1000, None).unwrap();
    request.add_path("/bin/sh").unwrap();

    // A record declaring more bytes than the message holds.
    let raw = MsgBuilder::new(Opcode::CsMultiReply)
        .u64(91)
        .u32(CsMultiOp::DelChecksum as u32)
        .u32(0)
        .u32(4096)
        .u32(0)
        .u32(0)
        .finish();
    session.channel_mut().push(raw);

    let err = session.csmulti(91, request).unwrap_err();
    assert!(matches!(err, ClientError::Op(TxError::Protocol)));
    assert_eq!(session.state(), SessionState::Connected);
}

#[test]
fn notifications_survive_closing_state() {
    let mut session = connected_session(ProtocolSet::NOTIFY);
    session.close_start().unwrap();

    let notify = MsgBuilder::new(Opcode::Notify)
        .u64(5)
        .u32(1)
        .bytes(b"event")
        .finish();
    session.process(notify).unwrap();
    assert!(session.has_notifications());
}

#[test]
fn channel_failure_fails_outstanding_transactions() {
    let mut session = connected_session(ProtocolSet::POLICY);
    session.policy_request_start(77, b"q").unwrap();

    // Script exhausted: the next pump hits a closed channel.
    let err = session.wait(77).unwrap_err();
    assert!(matches!(err, ClientError::Channel(_)));
    assert_eq!(session.state(), SessionState::Error);

    let completion = session.take_completion(77).unwrap();
    assert_eq!(completion.result, Err(TxError::Channel));
}
