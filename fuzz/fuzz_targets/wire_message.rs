//! Fuzz target for wire message verification
//!
//! Verification must never panic on arbitrary input, only return Ok or Err.

#![no_main]

use libfuzzer_sys::fuzz_target;
use warden_wire::WireMsg;

fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = WireMsg::verify(data.to_vec()) {
        // Field access on a verified message must also be panic-free.
        let _ = msg.token();
        let _ = msg.string_list();
        let _ = msg.read_u32(0);
        let _ = msg.read_u64(usize::MAX);
        let _ = msg.ack();
        let _ = msg.hello();
    }
});
