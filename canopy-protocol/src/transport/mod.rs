//! Transport boundary: the frame type every component exchanges and the
//! SocketCAN codec for putting frames on a real bus.

pub mod can_frame;
pub mod frame;

pub use can_frame::{decode_can_frame, encode_can_frame, CANFD_MTU, CAN_MTU};
pub use frame::{Frame, FrameError, MAX_FRAME_PAYLOAD};
