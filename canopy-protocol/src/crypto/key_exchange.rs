//! Key distribution primitives.
//!
//! Every message fits one CAN-FD frame:
//!
//! | Message | Layout | Size |
//! |---------|--------|------|
//! | Key request | `x25519 pubkey \|\| BLAKE3(pubkey)` | 64 |
//! | Key share | `nonce \|\| ChaCha20-Poly1305(symmetric key) \|\| tag` | 60 |
//! | Announcement | `x25519 pubkey \|\| ed25519 verifying key` | 64 |
//!
//! Shares are sealed under a tunnel key derived with HKDF-SHA256 from the
//! X25519 shared secret of the key server and the requesting peer.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use super::cipher::{
    open_with_key, seal_with_key, CipherError, SymmetricKey, KEY_SIZE, NONCE_SIZE, TAG_SIZE,
};
use super::constant_time::eq_32;

/// X25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// `pubkey || BLAKE3(pubkey)`
pub const KEY_REQUEST_SIZE: usize = PUBLIC_KEY_SIZE + 32;
/// `nonce || sealed symmetric key || tag`
pub const KEY_SHARE_SIZE: usize = NONCE_SIZE + KEY_SIZE + TAG_SIZE;
/// `x25519 pubkey || ed25519 verifying key`
pub const ANNOUNCEMENT_SIZE: usize = PUBLIC_KEY_SIZE + 32;

const TUNNEL_KEY_INFO: &[u8] = b"canopy-keyserver-exch";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyExchangeError {
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Malformed key request")]
    MalformedRequest,
    #[error("Public key digest mismatch")]
    DigestMismatch,
    #[error("Peer public key is low order")]
    NonContributory,
    #[error("Key derivation failed")]
    KeyDerivationFailed,
    #[error("Invalid signature")]
    InvalidSignature,
    #[error("Key share error: {0}")]
    Share(#[from] CipherError),
}

pub type Result<T> = std::result::Result<T, KeyExchangeError>;

// ─── Static X25519 identity ──────────────────────────────────────────────────

/// Long-lived X25519 key pair of a key-exchange endpoint.
pub struct StaticKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl StaticKeypair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    /// Restore from stored secret bytes. Clamping happens inside the scalar
    /// multiplication, any 32 bytes are accepted.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        StaticKeypair { secret, public }
    }

    pub fn public_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public.to_bytes()
    }

    /// ECDH with `their_public`, then HKDF-SHA256 into a tunnel key.
    ///
    /// # Arguments
    /// * `their_public` - Peer's 32-byte X25519 public key
    pub fn derive_tunnel_key(&self, their_public: &[u8]) -> Result<TunnelKey> {
        let their_public: [u8; PUBLIC_KEY_SIZE] = their_public
            .try_into()
            .map_err(|_| KeyExchangeError::InvalidKeyLength)?;

        let shared = self.secret.diffie_hellman(&PublicKey::from(their_public));
        if !shared.was_contributory() {
            return Err(KeyExchangeError::NonContributory);
        }

        let hkdf = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf.expand(TUNNEL_KEY_INFO, &mut key[..])
            .map_err(|_| KeyExchangeError::KeyDerivationFailed)?;

        Ok(TunnelKey(key))
    }
}

// ─── Tunnel key ──────────────────────────────────────────────────────────────

/// Per-peer key protecting symmetric-key shares in transit.
pub struct TunnelKey(SymmetricKey);

impl TunnelKey {
    /// Encrypt a symmetric key for the peer holding the other half of the ECDH.
    pub fn seal_share(&self, symmetric_key: &[u8; KEY_SIZE]) -> Result<Vec<u8>> {
        Ok(seal_with_key(&self.0, symmetric_key, &[])?)
    }

    /// Decrypt a share. Shares addressed to other peers fail authentication.
    pub fn open_share(&self, share: &[u8]) -> Result<SymmetricKey> {
        if share.len() != KEY_SHARE_SIZE {
            return Err(KeyExchangeError::InvalidKeyLength);
        }
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&share[..NONCE_SIZE]);

        let plaintext = Zeroizing::new(open_with_key(&self.0, &nonce, &share[NONCE_SIZE..], &[])?);
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(&plaintext);
        Ok(key)
    }
}

// ─── Key request ─────────────────────────────────────────────────────────────

pub fn public_key_digest(public: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 32] {
    *blake3::hash(public).as_bytes()
}

/// Encode a key request: the public key followed by its digest.
///
/// The digest is BLAKE3. Key servers that check a BLAKE2s digest reject
/// these requests, so both ends of a deployment must run this encoding.
pub fn encode_key_request(public: &[u8; PUBLIC_KEY_SIZE]) -> [u8; KEY_REQUEST_SIZE] {
    let mut request = [0u8; KEY_REQUEST_SIZE];
    request[..PUBLIC_KEY_SIZE].copy_from_slice(public);
    request[PUBLIC_KEY_SIZE..].copy_from_slice(&public_key_digest(public));
    request
}

/// Decode a key request and check its digest.
///
/// # Returns
/// The requesting peer's public key
pub fn decode_key_request(request: &[u8]) -> Result<[u8; PUBLIC_KEY_SIZE]> {
    if request.len() != KEY_REQUEST_SIZE {
        return Err(KeyExchangeError::MalformedRequest);
    }
    let mut public = [0u8; PUBLIC_KEY_SIZE];
    public.copy_from_slice(&request[..PUBLIC_KEY_SIZE]);
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&request[PUBLIC_KEY_SIZE..]);

    if !eq_32(&public_key_digest(&public), &digest) {
        return Err(KeyExchangeError::DigestMismatch);
    }
    Ok(public)
}

// ─── Key server announcement ─────────────────────────────────────────────────

/// Public keys a key server broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub exchange_key: [u8; PUBLIC_KEY_SIZE],
    pub signing_key: [u8; 32],
}

impl Announcement {
    pub fn encode(&self) -> [u8; ANNOUNCEMENT_SIZE] {
        let mut out = [0u8; ANNOUNCEMENT_SIZE];
        out[..PUBLIC_KEY_SIZE].copy_from_slice(&self.exchange_key);
        out[PUBLIC_KEY_SIZE..].copy_from_slice(&self.signing_key);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != ANNOUNCEMENT_SIZE {
            return Err(KeyExchangeError::InvalidKeyLength);
        }
        let mut exchange_key = [0u8; PUBLIC_KEY_SIZE];
        exchange_key.copy_from_slice(&bytes[..PUBLIC_KEY_SIZE]);
        let mut signing_key = [0u8; 32];
        signing_key.copy_from_slice(&bytes[PUBLIC_KEY_SIZE..]);
        Ok(Announcement {
            exchange_key,
            signing_key,
        })
    }
}

// ─── Ed25519 ─────────────────────────────────────────────────────────────────

/// Ed25519 key whose verifying half is announced next to the X25519 key.
pub struct SigningIdentity(SigningKey);

impl SigningIdentity {
    pub fn generate() -> Self {
        SigningIdentity(SigningKey::generate(&mut OsRng))
    }

    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        SigningIdentity(SigningKey::from_bytes(bytes))
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.0.verifying_key().to_bytes()
    }

    /// 64-byte Ed25519 signature over `data`.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.0.sign(data).to_bytes()
    }
}

/// Verify an Ed25519 signature against an announced verifying key.
pub fn verify_signature(verifying_key: &[u8; 32], data: &[u8], signature: &[u8]) -> Result<bool> {
    let signature: [u8; 64] = signature
        .try_into()
        .map_err(|_| KeyExchangeError::InvalidSignature)?;
    let verifying_key =
        VerifyingKey::from_bytes(verifying_key).map_err(|_| KeyExchangeError::InvalidKeyLength)?;

    Ok(verifying_key
        .verify(data, &Signature::from_bytes(&signature))
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::cipher::generate_key;

    #[test]
    fn test_tunnel_keys_agree() {
        let server = StaticKeypair::generate();
        let client = StaticKeypair::generate();

        let server_side = server.derive_tunnel_key(&client.public_bytes()).unwrap();
        let client_side = client.derive_tunnel_key(&server.public_bytes()).unwrap();

        let symmetric = generate_key();
        let share = server_side.seal_share(&symmetric).unwrap();
        assert_eq!(share.len(), KEY_SHARE_SIZE);
        assert_eq!(*client_side.open_share(&share).unwrap(), *symmetric);
    }

    #[test]
    fn test_share_for_other_peer_fails() {
        let server = StaticKeypair::generate();
        let alice = StaticKeypair::generate();
        let mallory = StaticKeypair::generate();

        let share = server
            .derive_tunnel_key(&alice.public_bytes())
            .unwrap()
            .seal_share(&generate_key())
            .unwrap();

        let wrong = mallory.derive_tunnel_key(&server.public_bytes()).unwrap();
        assert_eq!(
            wrong.open_share(&share).err(),
            Some(KeyExchangeError::Share(CipherError::AuthenticationFailed))
        );
    }

    #[test]
    fn test_low_order_point_rejected() {
        let keypair = StaticKeypair::generate();
        assert_eq!(
            keypair.derive_tunnel_key(&[0u8; 32]).err(),
            Some(KeyExchangeError::NonContributory)
        );
        assert_eq!(
            keypair.derive_tunnel_key(&[1u8; 31]).err(),
            Some(KeyExchangeError::InvalidKeyLength)
        );
    }

    #[test]
    fn test_stored_secret_restores_public() {
        let bytes = [0x24u8; 32];
        assert_eq!(
            StaticKeypair::from_secret_bytes(bytes).public_bytes(),
            StaticKeypair::from_secret_bytes(bytes).public_bytes()
        );
    }

    #[test]
    fn test_key_request_digest() {
        let public = StaticKeypair::generate().public_bytes();
        let request = encode_key_request(&public);
        assert_eq!(decode_key_request(&request).unwrap(), public);

        let mut forged = request;
        forged[0] ^= 1;
        assert_eq!(decode_key_request(&forged), Err(KeyExchangeError::DigestMismatch));
        assert_eq!(
            decode_key_request(&request[..63]),
            Err(KeyExchangeError::MalformedRequest)
        );
    }

    #[test]
    fn test_announcement_layout() {
        let announcement = Announcement {
            exchange_key: [1u8; 32],
            signing_key: [2u8; 32],
        };
        let bytes = announcement.encode();
        assert_eq!(bytes[0], 1);
        assert_eq!(bytes[32], 2);
        assert_eq!(Announcement::decode(&bytes).unwrap(), announcement);
        assert!(Announcement::decode(&bytes[..40]).is_err());
    }

    #[test]
    fn test_sign_verify() {
        let identity = SigningIdentity::generate();
        let public = identity.verifying_key_bytes();
        let signature = identity.sign(b"ticket");

        assert!(verify_signature(&public, b"ticket", &signature).unwrap());
        assert!(!verify_signature(&public, b"tampered", &signature).unwrap());
        assert_eq!(
            verify_signature(&public, b"ticket", &signature[..10]),
            Err(KeyExchangeError::InvalidSignature)
        );
    }
}
