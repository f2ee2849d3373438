#![no_main]

use libfuzzer_sys::fuzz_target;
use rust_dc::tth;

fuzz_target!(|data: &[u8]| {
    // Encoding then decoding any 24-byte digest must be lossless.
    if data.len() >= 24 {
        let mut digest = [0u8; 24];
        digest.copy_from_slice(&data[..24]);
        let s = tth::base32_encode(&digest);
        assert_eq!(tth::tth_from_str(&s), Some(digest));
    }
    // And decoding arbitrary strings must never panic.
    if let Ok(s) = std::str::from_utf8(data) {
        let mut out = [0u8; 24];
        let _ = tth::base32_decode(s, &mut out);
        let _ = tth::is_tth_str(s);
    }
});
