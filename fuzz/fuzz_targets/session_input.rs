//! Fuzz target for a listener fed arbitrary datagrams
//!
//! Hostile peers may send anything; the session must keep ticking without
//! panicking.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use nettester_core::{ClientConfig, Endpoint, MemoryEnvironment, MinimalClient};
use nettester_transport::MemoryNetwork;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Arbitrary)]
struct Datagram {
    peer: u8,
    bytes: Vec<u8>,
    advance_ms: u16,
}

fuzz_target!(|datagrams: Vec<Datagram>| {
    let env = MemoryEnvironment::new(MemoryNetwork::new());
    let Ok(mut listener) = MinimalClient::new(Box::new(env.clone()), ClientConfig::default())
    else {
        return;
    };
    if listener.listen(&Endpoint::new("127.0.0.1", 7777)).is_err() {
        return;
    }
    let target: SocketAddr = ([127, 0, 0, 1], 7777).into();

    for datagram in datagrams {
        let from = SocketAddr::from(([10, 0, 0, datagram.peer], 9000));
        env.network().inject(from, target, &datagram.bytes);
        listener.tick(Duration::from_millis(u64::from(datagram.advance_ms)));
    }
    listener.cleanup();
});
