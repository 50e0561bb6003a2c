//! Fuzz target for session encryption
//!
//! Round trips must succeed and arbitrary ciphertext must be rejected
//! without panicking.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use tether_crypto::Encryptor;

#[derive(Debug, Arbitrary)]
struct CryptoInput {
    key: [u8; 32],
    plaintext: Vec<u8>,
    ciphertext: Vec<u8>,
}

fuzz_target!(|input: CryptoInput| {
    let Ok(encryptor) = Encryptor::new(&input.key) else {
        return;
    };

    if let Ok(sealed) = encryptor.encrypt(&input.plaintext) {
        let opened = encryptor.decrypt(&sealed).expect("round trip");
        assert_eq!(opened, input.plaintext);
    }

    let _ = encryptor.decrypt(&input.ciphertext);
});
