//! In-memory broadcast bus.
//!
//! Every frame a port sends is delivered to every other attached port, the
//! way a CAN bus behaves with local loopback disabled. Frames that arrive
//! while a port's inbound queue is full back up into the shared medium; if
//! the medium overflows, the oldest frames are lost, just like bus noise.

use canopy_protocol::transport::Frame;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;

/// One endpoint's view of the bus.
pub struct BusPort {
    /// Frames written here reach every other port.
    pub outbound: mpsc::Sender<Frame>,
    /// Frames sent by every other port.
    pub inbound: mpsc::Receiver<Frame>,
}

pub struct LoopbackBus {
    medium: broadcast::Sender<(usize, Frame)>,
    next_port: AtomicUsize,
    queue_depth: usize,
}

impl LoopbackBus {
    /// Create a bus whose per-port queues hold `queue_depth` frames.
    pub fn new(queue_depth: usize) -> Self {
        let (medium, _) = broadcast::channel(queue_depth.max(1) * 16);
        Self {
            medium,
            next_port: AtomicUsize::new(0),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Attach a new port. Spawns the two forwarding tasks, so it must be
    /// called from within a tokio runtime.
    pub fn attach(&self) -> BusPort {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let (outbound, mut to_medium) = mpsc::channel::<Frame>(self.queue_depth);
        let (to_port, inbound) = mpsc::channel::<Frame>(self.queue_depth);

        let medium = self.medium.clone();
        tokio::spawn(async move {
            while let Some(frame) = to_medium.recv().await {
                // No receivers is fine: nobody else is on the bus yet
                let _ = medium.send((port, frame));
            }
        });

        let mut listener = self.medium.subscribe();
        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok((origin, frame)) if origin != port => {
                        if to_port.send(frame).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        log::warn!("Bus port {} lost {} frames", port, missed);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        BusPort { outbound, inbound }
    }
}
