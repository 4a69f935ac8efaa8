#![no_main]
use canopy_core::wire::{DataMessage, MessageKind, SessionMessage, StartMessage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic either decoder
    let _ = StartMessage::decode(data);
    let _ = DataMessage::decode(data);

    // Whatever decodes must re-encode to the same bytes
    for kind in [MessageKind::Start, MessageKind::Data] {
        if let Ok(message) = SessionMessage::decode(kind, data) {
            assert_eq!(message.kind(), kind);
            assert_eq!(message.encode(), data, "Re-encoding changed the frame");
        }
    }
});
