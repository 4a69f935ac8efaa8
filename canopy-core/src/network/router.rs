//! Routes inbound frames to the component that owns their message id.

use async_trait::async_trait;
use canopy_protocol::transport::Frame;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouterError {
    #[error("Message id {0:#x} is already routed")]
    DuplicateRoute(u32),
}

pub type Result<T> = std::result::Result<T, RouterError>;

/// A component that consumes frames for a fixed set of message ids.
///
/// `handle_frame` must never fail outward: invalid frames are dropped inside
/// the handler, so one bad frame cannot stall the receive loop.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    /// Message ids this handler consumes.
    fn message_ids(&self) -> Vec<u32>;

    async fn handle_frame(&self, frame: Frame);
}

/// Message id to handler table plus the inbound receive loop.
#[derive(Default, Clone)]
pub struct Router {
    routes: HashMap<u32, Arc<dyn FrameHandler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every id of `handler`. Nothing is registered if any id is
    /// already taken.
    pub fn register(&mut self, handler: Arc<dyn FrameHandler>) -> Result<&mut Self> {
        let ids = handler.message_ids();
        if let Some(id) = ids.iter().find(|id| self.routes.contains_key(id)) {
            return Err(RouterError::DuplicateRoute(*id));
        }
        for id in ids {
            self.routes.insert(id, handler.clone());
        }
        Ok(self)
    }

    pub fn routes(&self, id: u32) -> bool {
        self.routes.contains_key(&id)
    }

    /// Hand `frame` to its handler.
    ///
    /// # Returns
    /// `false` if no handler owns the frame's id
    pub async fn dispatch(&self, frame: Frame) -> bool {
        match self.routes.get(&frame.id) {
            Some(handler) => {
                handler.handle_frame(frame).await;
                true
            }
            None => false,
        }
    }

    /// Dispatch frames until the inbound stream closes.
    pub async fn run(self, mut inbound: mpsc::Receiver<Frame>) {
        while let Some(frame) = inbound.recv().await {
            self.dispatch(frame).await;
        }
        log::debug!("Inbound frame stream closed, router stopping");
    }

    pub fn spawn(self, inbound: mpsc::Receiver<Frame>) -> JoinHandle<()> {
        tokio::spawn(self.run(inbound))
    }
}
