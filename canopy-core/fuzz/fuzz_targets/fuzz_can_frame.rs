#![no_main]
use canopy_core::transport::{decode_can_frame, encode_can_frame};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Try decoding arbitrary kernel frames: must not panic
    if let Ok(frame) = decode_can_frame(data) {
        let encoded = encode_can_frame(&frame).expect("Decoded frame must re-encode");
        let again = decode_can_frame(&encoded).expect("Encoded frame must decode");
        assert_eq!(again, frame);
    }
});
