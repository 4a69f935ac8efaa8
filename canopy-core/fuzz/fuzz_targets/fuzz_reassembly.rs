#![no_main]
use arbitrary::Arbitrary;
use canopy_core::canopy::{Progress, Reassembly};
use canopy_core::crypto::Cipher;
use canopy_core::wire::{DataMessage, ExtraData, SealedTransfer, SessionId};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;

/// Feed a genuine Start followed by a mix of genuine and mutated chunks.
#[derive(Arbitrary, Debug)]
struct ReassemblyInput {
    payload: Vec<u8>,
    /// (chunk index, optional byte to flip, xor mask)
    deliveries: Vec<(u8, Option<u8>, u8)>,
}

fuzz_target!(|input: ReassemblyInput| {
    if input.payload.len() > 1024 || input.deliveries.len() > 128 {
        return;
    }

    let cipher = Arc::new(Cipher::with_key(&[0x11; 32]).unwrap());
    let transfer =
        SealedTransfer::seal(&cipher, SessionId(1), ExtraData::default(), &input.payload).unwrap();
    let mut session = Reassembly::open(&transfer.start, cipher.clone()).unwrap();

    for (index, flip, mask) in input.deliveries {
        let Some(chunk) = transfer.chunks.get(index as usize) else {
            continue;
        };
        let mut bytes = chunk.encode();
        if let Some(position) = flip {
            let position = position as usize % bytes.len();
            bytes[position] ^= mask;
        }
        let Ok(message) = DataMessage::decode(&bytes) else {
            continue;
        };

        // Only the genuine payload may ever come out
        match session.accept(&message) {
            Ok(Progress::Complete(payload)) => {
                assert_eq!(payload, input.payload);
                return;
            }
            Ok(Progress::Pending) | Err(_) => {}
        }
    }
});
