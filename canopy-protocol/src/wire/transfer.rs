//! Sealing a payload into one Start plus its Data chunks, and checking the
//! trailing whole-payload tag on the way back.
//!
//! The buffer that gets chunked is `payload || trailer`, where the trailer is
//! a cipher-data field produced by encrypting nothing with the payload as
//! associated data. Per-chunk tags protect each frame; the trailer protects
//! the reassembled whole.

use thiserror::Error;

use super::fields::{
    CipherData, ExtraData, MessageLength, SequenceNumber, SessionId, WireField,
    MAX_MESSAGE_LENGTH, MAX_SEQUENCE,
};
use super::messages::{chunk_capacity, DataMessage, StartMessage};
use crate::crypto::cipher::{Cipher, CipherError, CIPHER_OVERHEAD};
use crate::transport::frame::{Frame, FrameError, MAX_FRAME_PAYLOAD};

/// Bytes the trailing tag adds to every transfer.
pub const TRAILER_SIZE: usize = CIPHER_OVERHEAD;
/// Plaintext bytes per Data message on a CAN-FD frame.
pub const CHUNK_SIZE: usize = chunk_capacity(MAX_FRAME_PAYLOAD);
/// Largest payload whose declared length stays in range.
pub const MAX_PAYLOAD: usize = MAX_MESSAGE_LENGTH as usize - 1 - TRAILER_SIZE;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Transfer needs more than {} chunks", MAX_SEQUENCE)]
    TooManyChunks,
    #[error("Encryption error: {0}")]
    Cipher(#[from] CipherError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// One payload, sealed and split into the messages that carry it.
#[derive(Debug, Clone)]
pub struct SealedTransfer {
    pub start: StartMessage,
    pub chunks: Vec<DataMessage>,
}

impl SealedTransfer {
    /// Seal `payload` for `session_id` under the cipher's active key.
    pub fn seal(
        cipher: &Cipher,
        session_id: SessionId,
        extra: ExtraData,
        payload: &[u8],
    ) -> Result<Self> {
        Self::seal_with_chunk_size(cipher, session_id, extra, payload, CHUNK_SIZE)
    }

    /// Same as [`SealedTransfer::seal`] with an explicit chunk size, for buses
    /// with a smaller frame budget.
    pub fn seal_with_chunk_size(
        cipher: &Cipher,
        session_id: SessionId,
        extra: ExtraData,
        payload: &[u8],
        chunk_size: usize,
    ) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD {
            return Err(TransferError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        if chunk_size == 0 {
            return Err(TransferError::TooManyChunks);
        }

        let mut buffer = Vec::with_capacity(payload.len() + TRAILER_SIZE);
        buffer.extend_from_slice(payload);
        CipherData::seal(cipher, &[], payload)?.encode_into(&mut buffer);

        let length = MessageLength::new(buffer.len()).map_err(|_| TransferError::PayloadTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD,
        })?;
        let start = StartMessage::seal(cipher, session_id, length, extra)?;

        let chunks = buffer
            .chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| {
                let seq = SequenceNumber::new(index).map_err(|_| TransferError::TooManyChunks)?;
                Ok(DataMessage::seal(cipher, session_id, seq, chunk)?)
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SealedTransfer { start, chunks })
    }

    pub fn session_id(&self) -> SessionId {
        self.start.session_id
    }

    /// Encode into bus frames: the Start on `start_id`, then every chunk in
    /// sequence order on `data_id`.
    pub fn into_frames(self, start_id: u32, data_id: u32) -> Result<Vec<Frame>> {
        let mut frames = Vec::with_capacity(1 + self.chunks.len());
        frames.push(Frame::new(start_id, self.start.encode())?);
        for chunk in &self.chunks {
            frames.push(Frame::new(data_id, chunk.encode())?);
        }
        Ok(frames)
    }
}

/// Split a reassembled buffer into `payload || trailer` and verify the
/// trailer.
///
/// # Returns
/// The payload, or `None` if the buffer is too short or the tag is forged
pub fn open_trailer(cipher: &Cipher, mut buffer: Vec<u8>) -> Option<Vec<u8>> {
    let split = buffer.len().checked_sub(TRAILER_SIZE)?;
    let trailer = buffer.split_off(split);
    let (tag, _) = CipherData::decode(&trailer).ok()?;
    tag.open(cipher, &buffer).ok()?;
    Some(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cipher() -> Cipher {
        Cipher::with_key(&[0x5A; 32]).unwrap()
    }

    fn reassemble(cipher: &Cipher, transfer: &SealedTransfer) -> Vec<u8> {
        let mut buffer = Vec::new();
        for chunk in &transfer.chunks {
            buffer.extend(chunk.open(cipher).unwrap());
        }
        assert_eq!(buffer.len(), transfer.start.length.get());
        buffer
    }

    #[test]
    fn test_chunking_boundaries() {
        let cipher = cipher();
        for len in [0, 1, CHUNK_SIZE - TRAILER_SIZE, CHUNK_SIZE, 500, MAX_PAYLOAD] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let transfer =
                SealedTransfer::seal(&cipher, SessionId(len as u32), ExtraData::default(), &payload)
                    .unwrap();

            let expected_chunks = (len + TRAILER_SIZE).div_ceil(CHUNK_SIZE);
            assert_eq!(transfer.chunks.len(), expected_chunks, "len {}", len);
            for (index, chunk) in transfer.chunks.iter().enumerate() {
                assert_eq!(chunk.seq.get(), index);
                assert!(chunk.encode().len() <= MAX_FRAME_PAYLOAD);
            }

            let buffer = reassemble(&cipher, &transfer);
            assert_eq!(open_trailer(&cipher, buffer).unwrap(), payload);
        }
    }

    #[test]
    fn test_hello_scenario_lengths() {
        let cipher = cipher();
        let transfer =
            SealedTransfer::seal(&cipher, SessionId(0xAABBCCDD), ExtraData::default(), b"hello")
                .unwrap();
        assert_eq!(transfer.start.length.get(), 33);
        assert_eq!(transfer.chunks.len(), 2);
        assert_eq!(transfer.chunks[0].cipher_data.plaintext_len(), 31);
        assert_eq!(transfer.chunks[1].cipher_data.plaintext_len(), 2);
    }

    #[test]
    fn test_payload_too_large() {
        let cipher = cipher();
        let payload = vec![0u8; MAX_PAYLOAD + 1];
        let err = SealedTransfer::seal(&cipher, SessionId(1), ExtraData::default(), &payload)
            .unwrap_err();
        assert_eq!(
            err,
            TransferError::PayloadTooLarge {
                len: MAX_PAYLOAD + 1,
                max: MAX_PAYLOAD
            }
        );
    }

    #[test]
    fn test_too_many_chunks_for_small_frames() {
        let cipher = cipher();
        let payload = vec![0u8; 300];
        let result = SealedTransfer::seal_with_chunk_size(
            &cipher,
            SessionId(1),
            ExtraData::default(),
            &payload,
            1,
        );
        assert_eq!(result.unwrap_err(), TransferError::TooManyChunks);
    }

    #[test]
    fn test_forged_trailer_rejected() {
        let cipher = cipher();
        let transfer =
            SealedTransfer::seal(&cipher, SessionId(5), ExtraData::default(), b"payload").unwrap();
        let mut buffer = reassemble(&cipher, &transfer);
        buffer[0] ^= 0x80;
        assert!(open_trailer(&cipher, buffer).is_none());
        assert!(open_trailer(&cipher, vec![0u8; TRAILER_SIZE - 1]).is_none());
    }

    #[test]
    fn test_no_key() {
        let result = SealedTransfer::seal(&Cipher::new(), SessionId(1), ExtraData::default(), b"x");
        assert_eq!(result.unwrap_err(), TransferError::Cipher(CipherError::NoKey));
    }

    #[test]
    fn test_into_frames() {
        let cipher = cipher();
        let transfer =
            SealedTransfer::seal(&cipher, SessionId(2), ExtraData::default(), &[7u8; 40]).unwrap();
        let frames = transfer.into_frames(0x100, 0x101).unwrap();
        assert_eq!(frames.len(), 1 + 3);
        assert_eq!(frames[0].id, 0x100);
        assert!(frames[1..].iter().all(|f| f.id == 0x101));
    }
}
