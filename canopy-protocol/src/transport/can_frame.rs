//! Kernel SocketCAN frame layout.
//!
//! `struct canfd_frame` is 72 bytes: a native-endian (little-endian on every
//! supported target) 32-bit id word, a length byte, flags and two reserved
//! bytes, then up to 64 data bytes. A classic `struct can_frame` is 16 bytes
//! with the same header. The id word carries the EFF/RTR/ERR flags in its top
//! three bits.

use super::frame::{Frame, FrameError, Result, MAX_FRAME_PAYLOAD};

pub const CAN_MTU: usize = 16;
pub const CANFD_MTU: usize = 72;

pub const CAN_EFF_FLAG: u32 = 0x8000_0000;
pub const CAN_RTR_FLAG: u32 = 0x4000_0000;
pub const CAN_STANDARD_MASK: u32 = 0x0000_07FF;
pub const CAN_EXTENDED_MASK: u32 = 0x1FFF_FFFF;

const HEADER_SIZE: usize = 8;

/// Marshal `frame` into a CAN-FD frame. Ids that do not fit the 11-bit
/// standard range are sent with the extended-frame flag.
pub fn encode_can_frame(frame: &Frame) -> Result<[u8; CANFD_MTU]> {
    if frame.data.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::Oversized(frame.data.len()));
    }

    let mut id = frame.id;
    if id > CAN_STANDARD_MASK {
        id = (id & CAN_EXTENDED_MASK) | CAN_EFF_FLAG;
    }

    let mut raw = [0u8; CANFD_MTU];
    raw[..4].copy_from_slice(&id.to_le_bytes());
    raw[4] = frame.data.len() as u8;
    raw[HEADER_SIZE..HEADER_SIZE + frame.data.len()].copy_from_slice(&frame.data);
    Ok(raw)
}

/// Unmarshal a classic or CAN-FD frame read from a raw CAN socket.
pub fn decode_can_frame(raw: &[u8]) -> Result<Frame> {
    let mtu = raw.len();
    if mtu != CAN_MTU && mtu != CANFD_MTU {
        return Err(FrameError::BadMtu(mtu));
    }

    let mut id_word = [0u8; 4];
    id_word.copy_from_slice(&raw[..4]);
    let can_id = u32::from_le_bytes(id_word);

    let len = raw[4] as usize;
    if HEADER_SIZE + len > mtu {
        return Err(FrameError::BadLength { len, mtu });
    }

    let id = if can_id & CAN_EFF_FLAG != 0 {
        can_id & CAN_EXTENDED_MASK
    } else {
        can_id & CAN_STANDARD_MASK
    };

    Ok(Frame {
        id,
        data: raw[HEADER_SIZE..HEADER_SIZE + len].to_vec(),
    })
}
