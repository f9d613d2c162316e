//! Shared test helpers: server-side message builders and a handshake
//! driver.

use crate::channel::testing::ScriptChannel;
use crate::session::{ProtocolSet, Session, SessionState};
use warden_wire::{MsgBuilder, Opcode};

pub(crate) fn hello(min_version: u32, version: u32) -> Vec<u8> {
    MsgBuilder::new(Opcode::Hello)
        .u32(min_version)
        .u32(version)
        .finish()
}

pub(crate) fn ack(token: u64, acked: Opcode, error: u32) -> Vec<u8> {
    MsgBuilder::new(Opcode::Reply)
        .u64(token)
        .u32(acked as u32)
        .u32(error)
        .finish()
}

pub(crate) fn auth_reply(error: u32, uid: u32) -> Vec<u8> {
    MsgBuilder::new(Opcode::AuthReply).u32(error).u32(uid).finish()
}

pub(crate) fn opt_ack(options: &[&str]) -> Vec<u8> {
    let mut builder = MsgBuilder::new(Opcode::OptAck);
    for option in options {
        builder = builder.cstr(option);
    }
    builder.finish()
}

pub(crate) fn policy_reply(token: u64, flags: u32, error: u32, data: &[u8]) -> Vec<u8> {
    MsgBuilder::new(Opcode::PolicyReply)
        .u64(token)
        .u32(flags)
        .u32(error)
        .bytes(data)
        .finish()
}

/// Drive a full successful handshake over a scripted channel
pub(crate) fn establish(session: &mut Session<ScriptChannel>, protocols: ProtocolSet) {
    session.connect_start(protocols).unwrap();
    session.process(hello(3, 7)).unwrap();
    session.process(ack(0, Opcode::VerSel, 0)).unwrap();
    session.process(ack(0, Opcode::Auth, 0)).unwrap();
    session.process(auth_reply(0, 1000)).unwrap();
    session.process(opt_ack(&["MULTIPLEX", "PIPELINE"])).unwrap();
    session.process(ack(0, Opcode::ProtoSel, 0)).unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    session.take_completion(0).unwrap();
}
