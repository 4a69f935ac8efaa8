pub mod cipher;
pub mod constant_time;
pub mod key_exchange;

pub use cipher::{
    generate_key, Cipher, CipherError, SymmetricKey, CIPHER_OVERHEAD, KEY_SIZE, NONCE_SIZE,
    TAG_SIZE,
};
pub use key_exchange::{
    decode_key_request, encode_key_request, verify_signature, Announcement, KeyExchangeError,
    SigningIdentity, StaticKeypair, TunnelKey, ANNOUNCEMENT_SIZE, KEY_REQUEST_SIZE,
    KEY_SHARE_SIZE,
};
