#![no_main]
use canopy_core::crypto::{decode_key_request, encode_key_request, Announcement, StaticKeypair};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = Announcement::decode(data);

    if let Ok(public) = decode_key_request(data) {
        assert_eq!(encode_key_request(&public).as_slice(), data);

        // Any accepted key either yields a tunnel key or is rejected cleanly
        let keypair = StaticKeypair::from_secret_bytes([7u8; 32]);
        let _ = keypair.derive_tunnel_key(&public);
    }
});
