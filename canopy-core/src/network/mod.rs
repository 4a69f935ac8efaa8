pub mod loopback;
pub mod router;

pub use loopback::{BusPort, LoopbackBus};
pub use router::{FrameHandler, Router, RouterError};
