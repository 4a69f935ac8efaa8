use thiserror::Error;

/// CAN-FD payload ceiling.
pub const MAX_FRAME_PAYLOAD: usize = 64;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame payload too large: {0} bytes")]
    Oversized(usize),
    #[error("Unexpected CAN frame size: {0}")]
    BadMtu(usize),
    #[error("CAN length byte {len} exceeds frame of {mtu} bytes")]
    BadLength { len: usize, mtu: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;

/// One bus frame: a message id and up to [`MAX_FRAME_PAYLOAD`] bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u32,
    pub data: Vec<u8>,
}

impl Frame {
    /// Build a frame, rejecting payloads the bus cannot carry.
    pub fn new(id: u32, data: Vec<u8>) -> Result<Self> {
        if data.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::Oversized(data.len()));
        }
        Ok(Frame { id, data })
    }

    /// Empty frame, used as a bare signal.
    pub fn empty(id: u32) -> Self {
        Frame {
            id,
            data: Vec::new(),
        }
    }
}
