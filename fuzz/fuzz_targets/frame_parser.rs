//! Fuzz target for frame parsing
//!
//! The header decoder and frame parser must return `Ok` or `Err` for any
//! input, with and without a session key.

#![no_main]

use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use tether_core::wire::Header;
use tether_core::{BincodeCodec, FormatReceiver};
use tether_crypto::Encryptor;

fuzz_target!(|data: &[u8]| {
    let _ = Header::decode(data);

    let receiver = FormatReceiver::new(Arc::new(BincodeCodec::<String>::new()), 64 * 1024);
    let _ = receiver.parse(data, None);

    if let Ok(encryptor) = Encryptor::new(&[0x5A; 32]) {
        let _ = receiver.parse(data, Some(&encryptor));
    }
});
