//! Two-generation ChaCha20-Poly1305 wrapper.
//!
//! A [`Cipher`] holds the active symmetric key and, after the first rotation,
//! the key it replaced. Encryption always uses the active key. Decryption tries
//! the active key first and falls back to the previous one, so a session that
//! straddles a rekey broadcast still authenticates.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use zeroize::Zeroizing;

use super::constant_time::eq_32;

/// ChaCha20-Poly1305 key size.
pub const KEY_SIZE: usize = 32;
/// ChaCha20-Poly1305 nonce size.
pub const NONCE_SIZE: usize = 12;
/// Poly1305 tag size.
pub const TAG_SIZE: usize = 16;
/// Bytes added to every plaintext: nonce plus tag.
pub const CIPHER_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherError {
    #[error("No key installed")]
    NoKey,
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Encryption failed")]
    EncryptionFailed,
    #[error("Authentication failed")]
    AuthenticationFailed,
}

pub type Result<T> = std::result::Result<T, CipherError>;

/// Key bytes that are wiped when dropped.
pub type SymmetricKey = Zeroizing<[u8; KEY_SIZE]>;

#[derive(Default)]
struct Generations {
    current: Option<SymmetricKey>,
    previous: Option<SymmetricKey>,
}

/// Shared AEAD state referenced by clients, servers and the key exchange.
///
/// Both generations sit behind one lock, so a reader never observes a
/// half-applied rotation.
#[derive(Default)]
pub struct Cipher {
    generations: RwLock<Generations>,
}

impl fmt::Debug for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cipher")
            .field("ok", &self.ok())
            .field("has_previous", &self.has_previous())
            .finish()
    }
}

impl Cipher {
    /// Create a cipher with no key. [`Cipher::ok`] stays false until the
    /// first [`Cipher::update`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a cipher with an initial key.
    pub fn with_key(key: &[u8]) -> Result<Self> {
        let cipher = Self::new();
        cipher.update(key)?;
        Ok(cipher)
    }

    fn read(&self) -> RwLockReadGuard<'_, Generations> {
        self.generations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Generations> {
        self.generations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// True when a key is installed.
    pub fn ok(&self) -> bool {
        self.read().current.is_some()
    }

    /// True when a previous key generation is retained.
    pub fn has_previous(&self) -> bool {
        self.read().previous.is_some()
    }

    /// Install `new_key` as the active key and demote the active key to
    /// previous. The old previous key is dropped (and wiped).
    ///
    /// # Returns
    /// `true` if a rotation happened, `false` if `new_key` was already active
    pub fn update(&self, new_key: &[u8]) -> Result<bool> {
        if new_key.len() != KEY_SIZE {
            return Err(CipherError::InvalidKeyLength);
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(new_key);

        let mut generations = self.write();
        if let Some(current) = generations.current.as_ref() {
            if eq_32(current, &key) {
                return Ok(false);
            }
        }
        generations.previous = generations.current.take();
        generations.current = Some(key);
        drop(generations);

        log::debug!("Cipher key rotated");
        Ok(true)
    }

    /// Encrypt under the active key with a fresh random nonce.
    ///
    /// # Returns
    /// `nonce || ciphertext || tag`
    pub fn encrypt(&self, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
        let generations = self.read();
        let key = generations.current.as_ref().ok_or(CipherError::NoKey)?;
        seal_with_key(key, plaintext, ad)
    }

    /// Decrypt with the active key, then with the previous key.
    pub fn decrypt(
        &self,
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
        ad: &[u8],
    ) -> Result<Vec<u8>> {
        let generations = self.read();
        let current = generations.current.as_ref().ok_or(CipherError::NoKey)?;

        if let Ok(plaintext) = open_with_key(current, nonce, ciphertext, ad) {
            return Ok(plaintext);
        }
        match generations.previous.as_ref() {
            Some(previous) => open_with_key(previous, nonce, ciphertext, ad),
            None => Err(CipherError::AuthenticationFailed),
        }
    }
}

/// Generate a fresh random symmetric key.
pub fn generate_key() -> SymmetricKey {
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    OsRng.fill_bytes(&mut key[..]);
    key
}

/// Encrypt with an explicit key and a random nonce.
///
/// # Returns
/// `nonce || ciphertext || tag`
pub fn seal_with_key(key: &[u8; KEY_SIZE], plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>> {
    let aead = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)?;

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce_bytes);

    let sealed = aead
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: ad,
            },
        )
        .map_err(|_| CipherError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Decrypt `ciphertext || tag` with an explicit key.
pub fn open_with_key(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>> {
    let aead = ChaCha20Poly1305::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength)?;
    aead.decrypt(
        Nonce::from_slice(nonce),
        Payload {
            msg: ciphertext,
            aad: ad,
        },
    )
    .map_err(|_| CipherError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(sealed: &[u8]) -> ([u8; NONCE_SIZE], &[u8]) {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&sealed[..NONCE_SIZE]);
        (nonce, &sealed[NONCE_SIZE..])
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = Cipher::with_key(&[0x42; KEY_SIZE]).unwrap();
        let sealed = cipher.encrypt(b"chunk", b"header").unwrap();
        assert_eq!(sealed.len(), 5 + CIPHER_OVERHEAD);

        let (nonce, ct) = split(&sealed);
        assert_eq!(cipher.decrypt(&nonce, ct, b"header").unwrap(), b"chunk");
    }

    #[test]
    fn test_wrong_ad_fails() {
        let cipher = Cipher::with_key(&[0x42; KEY_SIZE]).unwrap();
        let sealed = cipher.encrypt(b"chunk", b"header").unwrap();
        let (nonce, ct) = split(&sealed);
        assert_eq!(
            cipher.decrypt(&nonce, ct, b"headeR"),
            Err(CipherError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_no_key() {
        let cipher = Cipher::new();
        assert!(!cipher.ok());
        assert_eq!(cipher.encrypt(b"", b""), Err(CipherError::NoKey));
        assert_eq!(
            cipher.decrypt(&[0u8; NONCE_SIZE], &[0u8; TAG_SIZE], b""),
            Err(CipherError::NoKey)
        );
    }

    #[test]
    fn test_invalid_key_length() {
        let cipher = Cipher::new();
        assert_eq!(cipher.update(&[1u8; 16]), Err(CipherError::InvalidKeyLength));
        assert!(!cipher.ok());
    }

    #[test]
    fn test_previous_key_fallback() {
        let cipher = Cipher::with_key(&[1u8; KEY_SIZE]).unwrap();
        let sealed = cipher.encrypt(b"before rotation", b"ad").unwrap();

        assert!(cipher.update(&[2u8; KEY_SIZE]).unwrap());
        assert!(cipher.has_previous());

        let (nonce, ct) = split(&sealed);
        assert_eq!(cipher.decrypt(&nonce, ct, b"ad").unwrap(), b"before rotation");
    }

    #[test]
    fn test_two_rotations_evict_oldest() {
        let cipher = Cipher::with_key(&[1u8; KEY_SIZE]).unwrap();
        let sealed = cipher.encrypt(b"stale", b"ad").unwrap();

        cipher.update(&[2u8; KEY_SIZE]).unwrap();
        cipher.update(&[3u8; KEY_SIZE]).unwrap();

        let (nonce, ct) = split(&sealed);
        assert_eq!(
            cipher.decrypt(&nonce, ct, b"ad"),
            Err(CipherError::AuthenticationFailed)
        );
    }

    #[test]
    fn test_same_key_update_keeps_previous() {
        let cipher = Cipher::with_key(&[1u8; KEY_SIZE]).unwrap();
        let sealed = cipher.encrypt(b"old", b"").unwrap();
        cipher.update(&[2u8; KEY_SIZE]).unwrap();

        // Re-sent key must not push the old generation out
        assert!(!cipher.update(&[2u8; KEY_SIZE]).unwrap());

        let (nonce, ct) = split(&sealed);
        assert_eq!(cipher.decrypt(&nonce, ct, b"").unwrap(), b"old");
    }

    #[test]
    fn test_fresh_nonce_per_encryption() {
        let cipher = Cipher::with_key(&[7u8; KEY_SIZE]).unwrap();
        let a = cipher.encrypt(b"same", b"same").unwrap();
        let b = cipher.encrypt(b"same", b"same").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
    }

    #[test]
    fn test_generate_key_is_random() {
        assert_ne!(*generate_key(), *generate_key());
    }
}
