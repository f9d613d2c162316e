//! Fuzz target for csmulti reply decoding
//!
//! Wraps arbitrary bytes in a valid message envelope so the record
//! decoder, not the CRC check, is exercised. Decoding must never panic
//! and must never resolve records out of a malformed reply.

#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_client::wire::{MsgBuilder, Opcode};
use warden_client::{
    Channel, ChannelError, ChannelResult, CsMultiOp, CsMultiRequest, ProtocolSet, Session,
    SessionConfig,
};

struct SinkChannel;

impl Channel for SinkChannel {
    fn send(&mut self, _msg: &[u8]) -> ChannelResult<()> {
        Ok(())
    }

    fn recv(&mut self) -> ChannelResult<Vec<u8>> {
        Err(ChannelError::Closed)
    }

    fn close(&mut self) -> ChannelResult<()> {
        Ok(())
    }
}

fn ack(acked: Opcode) -> Vec<u8> {
    MsgBuilder::new(Opcode::Reply)
        .u64(0)
        .u32(acked as u32)
        .u32(0)
        .finish()
}

fn connected() -> Session<SinkChannel> {
    let mut session = Session::new(SinkChannel, SessionConfig::default());
    session.connect_start(ProtocolSet::POLICY).unwrap();
    session
        .process(MsgBuilder::new(Opcode::Hello).u32(3).u32(7).finish())
        .unwrap();
    session.process(ack(Opcode::VerSel)).unwrap();
    session.process(ack(Opcode::Auth)).unwrap();
    session
        .process(MsgBuilder::new(Opcode::AuthReply).u32(0).u32(0).finish())
        .unwrap();
    session
        .process(MsgBuilder::new(Opcode::OptAck).finish())
        .unwrap();
    session.process(ack(Opcode::ProtoSel)).unwrap();
    session
}

fuzz_target!(|data: &[u8]| {
    let mut session = connected();

    let mut request = CsMultiRequest::new(CsMultiOp::GetChecksum, 0, None).unwrap();
    request.add_path("/a").unwrap();
    request.add_path("/b").unwrap();
    session.csmulti_start(1, request).unwrap();

    let raw = MsgBuilder::new(Opcode::CsMultiReply)
        .u64(1)
        .bytes(data)
        .finish();
    let _ = session.process(raw);

    if let Some(completion) = session.take_completion(1) {
        let request = completion.csmulti.expect("csmulti completion keeps its request");
        if completion.result.is_err() {
            // A rejected reply must not resolve anything.
            assert_eq!(request.pending_count(), 2);
        }
    }
});
