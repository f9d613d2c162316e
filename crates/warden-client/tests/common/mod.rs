//! Shared fixtures for the session integration tests: a scripted
//! channel and server-side message builders.
#![allow(dead_code)]

use std::collections::VecDeque;
use warden_client::{Channel, ChannelError, ChannelResult, ProtocolSet, Session, SessionConfig};
use warden_client::wire::{MsgBuilder, Opcode};

/// Scripted channel: queue the server's messages up front, then inspect
/// everything the session sent.
#[derive(Default)]
pub struct ScriptChannel {
    pub inbound: VecDeque<Vec<u8>>,
    pub sent: Vec<Vec<u8>>,
    pub closed: bool,
}

impl ScriptChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, raw: Vec<u8>) {
        self.inbound.push_back(raw);
    }
}

impl Channel for ScriptChannel {
    fn send(&mut self, msg: &[u8]) -> ChannelResult<()> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        self.sent.push(msg.to_vec());
        Ok(())
    }

    fn recv(&mut self) -> ChannelResult<Vec<u8>> {
        self.inbound.pop_front().ok_or(ChannelError::Closed)
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.closed = true;
        Ok(())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn hello(min_version: u32, version: u32) -> Vec<u8> {
    MsgBuilder::new(Opcode::Hello)
        .u32(min_version)
        .u32(version)
        .finish()
}

pub fn ack(token: u64, acked: Opcode, error: u32) -> Vec<u8> {
    MsgBuilder::new(Opcode::Reply)
        .u64(token)
        .u32(acked as u32)
        .u32(error)
        .finish()
}

pub fn auth_reply(error: u32, uid: u32) -> Vec<u8> {
    MsgBuilder::new(Opcode::AuthReply).u32(error).u32(uid).finish()
}

pub fn opt_ack(options: &[&str]) -> Vec<u8> {
    let mut builder = MsgBuilder::new(Opcode::OptAck);
    for option in options {
        builder = builder.cstr(option);
    }
    builder.finish()
}

pub fn stream_reply(opcode: Opcode, token: u64, flags: u32, error: u32, data: &[u8]) -> Vec<u8> {
    MsgBuilder::new(opcode)
        .u64(token)
        .u32(flags)
        .u32(error)
        .bytes(data)
        .finish()
}

/// The server side of a successful handshake, in order
pub fn handshake_script(uid: u32) -> Vec<Vec<u8>> {
    vec![
        hello(3, 7),
        ack(0, Opcode::VerSel, 0),
        ack(0, Opcode::Auth, 0),
        auth_reply(0, uid),
        opt_ack(&["MULTIPLEX", "PIPELINE"]),
        ack(0, Opcode::ProtoSel, 0),
    ]
}

/// A session that has already completed its handshake
pub fn connected_session(protocols: ProtocolSet) -> Session<ScriptChannel> {
    let mut chan = ScriptChannel::new();
    for raw in handshake_script(1000) {
        chan.push(raw);
    }
    let mut session = Session::new(chan, SessionConfig::default());
    session.connect(protocols).unwrap();
    session
}
