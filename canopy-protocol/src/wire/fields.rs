//! Fixed-grammar wire fields.
//!
//! Every numeric field is big-endian. Fields are either fixed width or, in the
//! case of [`CipherData`], consume the rest of the buffer. Decoding never
//! panics: short input and out-of-range values come back as [`FieldError`],
//! which is what keeps associated-data reconstruction byte-exact on both ends.

use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt;
use thiserror::Error;

use crate::crypto::cipher::{Cipher, CipherError, CIPHER_OVERHEAD, NONCE_SIZE};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldError {
    #[error("Truncated field: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("Field value out of range")]
    OutOfRange,
}

pub type Result<T> = std::result::Result<T, FieldError>;

/// Exclusive upper bound on a declared message length.
pub const MAX_MESSAGE_LENGTH: u16 = 7900;
/// Exclusive upper bound on a sequence number.
pub const MAX_SEQUENCE: usize = 256;
/// Width of the opaque extra-data field.
pub const EXTRA_DATA_SIZE: usize = 30;

/// Codec shared by every wire field.
pub trait WireField: Sized {
    /// Encoded width, `None` for fields that consume the rest of the buffer.
    const FIELD_SIZE: Option<usize>;

    /// Decode from the front of `bytes`.
    ///
    /// # Returns
    /// The value and the number of bytes consumed
    fn decode(bytes: &[u8]) -> Result<(Self, usize)>;

    /// Append the encoding to `out`.
    fn encode_into(&self, out: &mut Vec<u8>);

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }
}

fn take<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes
        .get(..N)
        .and_then(|head| head.try_into().ok())
        .ok_or(FieldError::Truncated {
            needed: N,
            available: bytes.len(),
        })
}

// ─── Session ID ──────────────────────────────────────────────────────────────

/// Random 32-bit identifier of one logical transfer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u32);

impl SessionId {
    /// Draw an identifier from the OS CSPRNG.
    pub fn random() -> Self {
        SessionId(OsRng.next_u32())
    }
}

impl From<u32> for SessionId {
    fn from(value: u32) -> Self {
        SessionId(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({:08x})", self.0)
    }
}

impl WireField for SessionId {
    const FIELD_SIZE: Option<usize> = Some(4);

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        Ok((SessionId(u32::from_be_bytes(take::<4>(bytes)?)), 4))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_be_bytes());
    }
}

// ─── Message Length ──────────────────────────────────────────────────────────

/// Total byte count of a transfer, declared once in its Start message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageLength(u16);

impl MessageLength {
    pub fn new(value: usize) -> Result<Self> {
        if value >= MAX_MESSAGE_LENGTH as usize {
            return Err(FieldError::OutOfRange);
        }
        Ok(MessageLength(value as u16))
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl WireField for MessageLength {
    const FIELD_SIZE: Option<usize> = Some(2);

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let value = u16::from_be_bytes(take::<2>(bytes)?);
        Ok((MessageLength::new(value as usize)?, 2))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_be_bytes());
    }
}

// ─── Sequence Number ─────────────────────────────────────────────────────────

/// Position of a Data message within its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u8);

impl SequenceNumber {
    pub const FIRST: SequenceNumber = SequenceNumber(0);

    /// Build from a chunk index. Indices past 255 cannot be represented,
    /// a transfer that needs them is invalid.
    pub fn new(index: usize) -> Result<Self> {
        if index >= MAX_SEQUENCE {
            return Err(FieldError::OutOfRange);
        }
        Ok(SequenceNumber(index as u8))
    }

    pub fn get(self) -> usize {
        self.0 as usize
    }
}

impl WireField for SequenceNumber {
    const FIELD_SIZE: Option<usize> = Some(1);

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        let [value] = take::<1>(bytes)?;
        Ok((SequenceNumber::new(value as usize)?, 1))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.0);
    }
}

// ─── Extra Data ──────────────────────────────────────────────────────────────

/// Authenticated but unencrypted context carried by Start messages.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ExtraData([u8; EXTRA_DATA_SIZE]);

impl Default for ExtraData {
    fn default() -> Self {
        ExtraData([0u8; EXTRA_DATA_SIZE])
    }
}

impl ExtraData {
    /// Zero-pad `value` to the field width.
    pub fn from_slice(value: &[u8]) -> Result<Self> {
        if value.len() > EXTRA_DATA_SIZE {
            return Err(FieldError::OutOfRange);
        }
        let mut bytes = [0u8; EXTRA_DATA_SIZE];
        bytes[..value.len()].copy_from_slice(value);
        Ok(ExtraData(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; EXTRA_DATA_SIZE] {
        &self.0
    }
}

impl From<[u8; EXTRA_DATA_SIZE]> for ExtraData {
    fn from(bytes: [u8; EXTRA_DATA_SIZE]) -> Self {
        ExtraData(bytes)
    }
}

impl fmt::Debug for ExtraData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExtraData(")?;
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

impl WireField for ExtraData {
    const FIELD_SIZE: Option<usize> = Some(EXTRA_DATA_SIZE);

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        Ok((ExtraData(take::<EXTRA_DATA_SIZE>(bytes)?), EXTRA_DATA_SIZE))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0);
    }
}

// ─── Cipher Data ─────────────────────────────────────────────────────────────

/// `nonce || ciphertext || tag`, always the last field of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherData {
    nonce: [u8; NONCE_SIZE],
    sealed: Vec<u8>,
}

impl CipherData {
    /// Encrypt `plaintext` under the cipher's active key.
    pub fn seal(
        cipher: &Cipher,
        plaintext: &[u8],
        ad: &[u8],
    ) -> std::result::Result<Self, CipherError> {
        let bytes = cipher.encrypt(plaintext, ad)?;
        // Cipher output always carries at least nonce and tag
        Self::decode(&bytes)
            .map(|(data, _)| data)
            .map_err(|_| CipherError::EncryptionFailed)
    }

    /// Decrypt with the current-or-previous key.
    pub fn open(&self, cipher: &Cipher, ad: &[u8]) -> std::result::Result<Vec<u8>, CipherError> {
        cipher.decrypt(&self.nonce, &self.sealed, ad)
    }

    /// Plaintext length this field carries.
    pub fn plaintext_len(&self) -> usize {
        self.sealed.len() + NONCE_SIZE - CIPHER_OVERHEAD
    }

    /// Encoded width.
    pub fn encoded_len(&self) -> usize {
        NONCE_SIZE + self.sealed.len()
    }
}

impl WireField for CipherData {
    const FIELD_SIZE: Option<usize> = None;

    fn decode(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < CIPHER_OVERHEAD {
            return Err(FieldError::Truncated {
                needed: CIPHER_OVERHEAD,
                available: bytes.len(),
            });
        }
        let nonce = take::<NONCE_SIZE>(bytes)?;
        Ok((
            CipherData {
                nonce,
                sealed: bytes[NONCE_SIZE..].to_vec(),
            },
            bytes.len(),
        ))
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.sealed);
    }
}
