#![no_main]

//! Fuzz target for subscriber-side signature verification.
//!
//! Arbitrary header values and bodies must never panic, and a signature is
//! only ever accepted for the exact body it was computed over.

use courier_delivery::signing::{sign, verify_signature};
use libfuzzer_sys::fuzz_target;

const SECRET: &str = "whsec_fuzz";

fuzz_target!(|data: &[u8]| {
    let split = data.first().map_or(0, |&n| usize::from(n)).min(data.len());
    let (header, body) = data.split_at(split);
    let signature = sign(body, SECRET).expect("fixed secret always signs");

    if let Ok(header) = std::str::from_utf8(header) {
        if verify_signature(body, header, SECRET) {
            assert_eq!(header.to_ascii_lowercase(), signature);
        }
    }

    assert!(verify_signature(body, &signature, SECRET));
    assert!(!verify_signature(body, &signature, "whsec_other"));
    if let Some(stripped) = signature.strip_prefix("sha256=") {
        assert!(!verify_signature(body, stripped, SECRET));
    }
});
