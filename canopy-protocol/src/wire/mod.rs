//! Canopy wire format: typed fields, the two message shapes, and transfer
//! sealing.

pub mod fields;
pub mod messages;
pub mod transfer;

pub use fields::{
    CipherData, ExtraData, FieldError, MessageLength, SequenceNumber, SessionId, WireField,
    EXTRA_DATA_SIZE, MAX_MESSAGE_LENGTH, MAX_SEQUENCE,
};
pub use messages::{chunk_capacity, DataMessage, MessageKind, SessionMessage, StartMessage};
pub use transfer::{
    open_trailer, SealedTransfer, TransferError, CHUNK_SIZE, MAX_PAYLOAD, TRAILER_SIZE,
};
