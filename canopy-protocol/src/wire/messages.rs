//! Start and Data messages.
//!
//! A frame carries no discriminator: the transport-level message id decides
//! whether the bytes are decoded as a [`StartMessage`] or a [`DataMessage`].
//! Each message authenticates all of its non-cipher fields, in declaration
//! order, as associated data.

use super::fields::{
    self, CipherData, ExtraData, MessageLength, SequenceNumber, SessionId, WireField,
    EXTRA_DATA_SIZE,
};
use crate::crypto::cipher::{Cipher, CipherError, CIPHER_OVERHEAD};

/// Decoder selected by the frame's message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Start,
    Data,
}

/// Positional field reader over one frame payload.
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, offset: 0 }
    }

    fn field<F: WireField>(&mut self) -> fields::Result<F> {
        let rest = self.bytes.get(self.offset..).unwrap_or_default();
        let (value, used) = F::decode(rest)?;
        self.offset += used;
        Ok(value)
    }
}

// ─── Start ───────────────────────────────────────────────────────────────────

/// Opens a session: declares its total length and proves key possession.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartMessage {
    pub session_id: SessionId,
    pub length: MessageLength,
    pub extra: ExtraData,
    pub cipher_data: CipherData,
}

fn start_ad(session_id: SessionId, length: MessageLength, extra: &ExtraData) -> Vec<u8> {
    let mut ad = Vec::with_capacity(StartMessage::HEADER_SIZE);
    session_id.encode_into(&mut ad);
    length.encode_into(&mut ad);
    extra.encode_into(&mut ad);
    ad
}

impl StartMessage {
    /// Width of the authenticated header.
    pub const HEADER_SIZE: usize = 4 + 2 + EXTRA_DATA_SIZE;
    /// Smallest valid encoding (empty hello).
    pub const MIN_SIZE: usize = Self::HEADER_SIZE + CIPHER_OVERHEAD;

    /// Build a Start whose cipher data is a keyed hello over the header.
    pub fn seal(
        cipher: &Cipher,
        session_id: SessionId,
        length: MessageLength,
        extra: ExtraData,
    ) -> Result<Self, CipherError> {
        let cipher_data = CipherData::seal(cipher, &[], &start_ad(session_id, length, &extra))?;
        Ok(StartMessage {
            session_id,
            length,
            extra,
            cipher_data,
        })
    }

    pub fn associated_data(&self) -> Vec<u8> {
        start_ad(self.session_id, self.length, &self.extra)
    }

    /// Check the hello against the current-or-previous key.
    pub fn verify(&self, cipher: &Cipher) -> Result<(), CipherError> {
        self.cipher_data
            .open(cipher, &self.associated_data())
            .map(|_| ())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.associated_data();
        self.cipher_data.encode_into(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> fields::Result<Self> {
        let mut reader = Reader::new(bytes);
        Ok(StartMessage {
            session_id: reader.field()?,
            length: reader.field()?,
            extra: reader.field()?,
            cipher_data: reader.field()?,
        })
    }
}

// ─── Data ────────────────────────────────────────────────────────────────────

/// Carries one encrypted chunk of a session's payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMessage {
    pub session_id: SessionId,
    pub seq: SequenceNumber,
    pub cipher_data: CipherData,
}

fn data_ad(session_id: SessionId, seq: SequenceNumber) -> Vec<u8> {
    let mut ad = Vec::with_capacity(DataMessage::HEADER_SIZE);
    session_id.encode_into(&mut ad);
    seq.encode_into(&mut ad);
    ad
}

impl DataMessage {
    pub const HEADER_SIZE: usize = 4 + 1;
    /// Smallest valid encoding (empty chunk).
    pub const MIN_SIZE: usize = Self::HEADER_SIZE + CIPHER_OVERHEAD;

    pub fn seal(
        cipher: &Cipher,
        session_id: SessionId,
        seq: SequenceNumber,
        chunk: &[u8],
    ) -> Result<Self, CipherError> {
        let cipher_data = CipherData::seal(cipher, chunk, &data_ad(session_id, seq))?;
        Ok(DataMessage {
            session_id,
            seq,
            cipher_data,
        })
    }

    pub fn associated_data(&self) -> Vec<u8> {
        data_ad(self.session_id, self.seq)
    }

    /// Decrypt the chunk.
    pub fn open(&self, cipher: &Cipher) -> Result<Vec<u8>, CipherError> {
        self.cipher_data.open(cipher, &self.associated_data())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.associated_data();
        self.cipher_data.encode_into(&mut out);
        out
    }

    pub fn decode(bytes: &[u8]) -> fields::Result<Self> {
        let mut reader = Reader::new(bytes);
        Ok(DataMessage {
            session_id: reader.field()?,
            seq: reader.field()?,
            cipher_data: reader.field()?,
        })
    }
}

/// Plaintext bytes one Data message can carry in a frame of `frame_capacity`.
pub const fn chunk_capacity(frame_capacity: usize) -> usize {
    frame_capacity.saturating_sub(DataMessage::MIN_SIZE)
}

// ─── Either shape ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    Start(StartMessage),
    Data(DataMessage),
}

impl SessionMessage {
    pub fn decode(kind: MessageKind, bytes: &[u8]) -> fields::Result<Self> {
        match kind {
            MessageKind::Start => StartMessage::decode(bytes).map(SessionMessage::Start),
            MessageKind::Data => DataMessage::decode(bytes).map(SessionMessage::Data),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        match self {
            SessionMessage::Start(start) => start.encode(),
            SessionMessage::Data(data) => data.encode(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            SessionMessage::Start(_) => MessageKind::Start,
            SessionMessage::Data(_) => MessageKind::Data,
        }
    }

    pub fn session_id(&self) -> SessionId {
        match self {
            SessionMessage::Start(start) => start.session_id,
            SessionMessage::Data(data) => data.session_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::frame::MAX_FRAME_PAYLOAD;
    use hex_literal::hex;

    fn cipher() -> Cipher {
        Cipher::with_key(&[0x11; 32]).unwrap()
    }

    #[test]
    fn test_start_layout() {
        let cipher = cipher();
        let start = StartMessage::seal(
            &cipher,
            SessionId(0xAABBCCDD),
            MessageLength::new(33).unwrap(),
            ExtraData::from_slice(b"corr").unwrap(),
        )
        .unwrap();

        let bytes = start.encode();
        assert_eq!(bytes.len(), StartMessage::MIN_SIZE);
        assert_eq!(bytes.len(), MAX_FRAME_PAYLOAD);
        assert_eq!(&bytes[..6], &hex!("AABBCCDD 0021"));
        assert_eq!(&bytes[6..10], b"corr");

        let decoded = StartMessage::decode(&bytes).unwrap();
        assert_eq!(decoded, start);
        assert!(decoded.verify(&cipher).is_ok());
    }

    #[test]
    fn test_start_rejects_header_tamper() {
        let cipher = cipher();
        let start = StartMessage::seal(
            &cipher,
            SessionId(1),
            MessageLength::new(40).unwrap(),
            ExtraData::default(),
        )
        .unwrap();

        let mut bytes = start.encode();
        bytes[5] ^= 0x01;
        let forged = StartMessage::decode(&bytes).unwrap();
        assert_eq!(forged.verify(&cipher), Err(CipherError::AuthenticationFailed));
    }

    #[test]
    fn test_start_rejects_out_of_range_length() {
        let mut bytes = vec![0u8; StartMessage::MIN_SIZE];
        bytes[4..6].copy_from_slice(&7900u16.to_be_bytes());
        assert!(StartMessage::decode(&bytes).is_err());
    }

    #[test]
    fn test_data_roundtrip_and_tamper() {
        let cipher = cipher();
        let seq = SequenceNumber::new(3).unwrap();
        let data = DataMessage::seal(&cipher, SessionId(9), seq, b"chunk").unwrap();

        let bytes = data.encode();
        assert_eq!(bytes.len(), DataMessage::MIN_SIZE + 5);
        let decoded = DataMessage::decode(&bytes).unwrap();
        assert_eq!(decoded.open(&cipher).unwrap(), b"chunk");

        // The sequence number is authenticated
        let mut moved = bytes.clone();
        moved[4] = 4;
        let moved = DataMessage::decode(&moved).unwrap();
        assert!(moved.open(&cipher).is_err());
    }

    #[test]
    fn test_short_frames_rejected() {
        assert!(DataMessage::decode(&[0u8; DataMessage::MIN_SIZE - 1]).is_err());
        assert!(StartMessage::decode(&[0u8; StartMessage::MIN_SIZE - 1]).is_err());
        assert!(SessionMessage::decode(MessageKind::Data, &[]).is_err());
    }

    #[test]
    fn test_chunk_capacity() {
        assert_eq!(chunk_capacity(MAX_FRAME_PAYLOAD), 31);
        assert_eq!(chunk_capacity(8), 0);
    }

    #[test]
    fn test_session_message_dispatch() {
        let cipher = cipher();
        let data = DataMessage::seal(&cipher, SessionId(77), SequenceNumber::FIRST, b"x").unwrap();
        let message = SessionMessage::decode(MessageKind::Data, &data.encode()).unwrap();
        assert_eq!(message.kind(), MessageKind::Data);
        assert_eq!(message.session_id(), SessionId(77));
        assert_eq!(message.encode(), data.encode());
    }
}
