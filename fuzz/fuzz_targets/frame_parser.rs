//! Fuzz target for packet parsing
//!
//! The parser must never panic, and anything it accepts must survive an
//! encode/parse cycle unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use nettester_core::Packet;
use nettester_core::frame::decode_text;

fuzz_target!(|data: &[u8]| {
    if let Ok(packet) = Packet::parse(data) {
        let encoded = packet.encode();
        assert_eq!(Packet::parse(&encoded), Ok(packet));
    }

    let _ = decode_text(data);
});
