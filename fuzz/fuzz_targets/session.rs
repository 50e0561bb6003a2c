//! Fuzz target for the SRP exchange
//!
//! Malformed session data from a server and malformed responses from a
//! client must fail cleanly.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use std::sync::OnceLock;
use tether_crypto::Authenticator;

#[derive(Debug, Arbitrary)]
struct SessionInput {
    session: Vec<u8>,
    response: Vec<u8>,
}

fn verifier() -> &'static [u8] {
    static VERIFIER: OnceLock<Vec<u8>> = OnceLock::new();
    VERIFIER.get_or_init(|| Authenticator::create_verifier("alice", "hunter2").expect("verifier"))
}

fuzz_target!(|input: SessionInput| {
    let _ = Authenticator::create_encryptor(&input.session, "alice", "hunter2");

    if let Ok(session) = Authenticator::create_session("alice", verifier()) {
        let _ = session.create_encryptor(&input.response);
    }
});
