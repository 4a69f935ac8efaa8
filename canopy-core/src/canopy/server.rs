//! Canopy responder.
//!
//! Reassembles request sessions from the bus, hands each verified payload to
//! the application's [`ReplyBuilder`] and sends the reply back over the
//! reply channel with the same session id. Every invalid frame is dropped
//! without a trace on the bus.

use async_trait::async_trait;
use canopy_protocol::crypto::Cipher;
use canopy_protocol::transport::Frame;
use canopy_protocol::wire::{
    DataMessage, ExtraData, MessageKind, SealedTransfer, SessionId, StartMessage,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::session::{DropReason, Progress, Reassembly, Retain, SessionTable};
use crate::config::{CanopyConfig, MessageIds};
use crate::network::FrameHandler;

/// A fully received and authenticated request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub session_id: SessionId,
    pub payload: Vec<u8>,
    /// Extra data from the request's Start.
    pub extra: ExtraData,
}

/// Application hook producing the reply for a request.
#[async_trait]
pub trait ReplyBuilder: Send + Sync + 'static {
    async fn build_reply(&self, request: &Request) -> Vec<u8>;
}

#[async_trait]
impl<F, Fut> ReplyBuilder for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Vec<u8>> + Send + 'static,
{
    async fn build_reply(&self, request: &Request) -> Vec<u8> {
        (self)(request.clone()).await
    }
}

/// Result of applying one inbound frame.
#[derive(Debug)]
enum ServerEvent {
    Opened(SessionId),
    Progressed(SessionId),
    Completed(Request),
}

/// Everything a spawned reply task needs.
#[derive(Clone)]
struct ReplySender {
    cipher: Arc<Cipher>,
    outbound: mpsc::Sender<Frame>,
    ids: MessageIds,
    builder: Arc<dyn ReplyBuilder>,
}

impl ReplySender {
    async fn reply(self, request: Request) {
        let session_id = request.session_id;
        let reply = self.builder.build_reply(&request).await;

        // The reply Start echoes the request's extra data
        let frames = match SealedTransfer::seal(&self.cipher, session_id, request.extra, &reply)
            .and_then(|transfer| transfer.into_frames(self.ids.reply_start, self.ids.reply_data))
        {
            Ok(frames) => frames,
            Err(e) => {
                log::error!("Cannot send reply for session {}: {}", session_id, e);
                return;
            }
        };

        for frame in frames {
            if self.outbound.send(frame).await.is_err() {
                log::warn!("Outbound queue closed, reply for {} abandoned", session_id);
                return;
            }
        }
        log::debug!("Sent {} byte reply for session {}", reply.len(), session_id);
    }
}

pub struct Server {
    sessions: Arc<SessionTable<Reassembly>>,
    replies: ReplySender,
    session_timeout: Duration,
    sweep_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl Server {
    /// # Arguments
    /// * `cipher` - Shared cipher, rotated by the key exchange
    /// * `outbound` - Queue toward the bus
    /// * `config` - Message ids and timing
    /// * `builder` - Application reply hook
    pub fn new(
        cipher: Arc<Cipher>,
        outbound: mpsc::Sender<Frame>,
        config: &CanopyConfig,
        builder: impl ReplyBuilder,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            sessions: Arc::new(SessionTable::new()),
            replies: ReplySender {
                cipher,
                outbound,
                ids: config.message_ids,
                builder: Arc::new(builder),
            },
            session_timeout: config.session_timeout,
            sweep_interval: config.sweep_interval,
            shutdown,
        }
    }

    /// Number of sessions currently being received.
    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn has_session(&self, id: SessionId) -> bool {
        self.sessions.contains(id)
    }

    /// Handle a frame from the request Start channel.
    pub async fn on_start_frame(&self, frame: &Frame) {
        self.handle(MessageKind::Start, frame);
    }

    /// Handle a frame from the request Data channel.
    pub async fn on_data_frame(&self, frame: &Frame) {
        self.handle(MessageKind::Data, frame);
    }

    fn handle(&self, kind: MessageKind, frame: &Frame) {
        match self.classify_frame(kind, frame) {
            Ok(ServerEvent::Opened(id)) => log::debug!("Session {} opened", id),
            Ok(ServerEvent::Progressed(id)) => log::trace!("Session {} advanced", id),
            Ok(ServerEvent::Completed(request)) => {
                log::info!(
                    "Session {} complete, {} bytes",
                    request.session_id,
                    request.payload.len()
                );
                tokio::spawn(self.replies.clone().reply(request));
            }
            Err(reason) => log::debug!("Dropped {:?} frame: {:?}", kind, reason),
        }
    }

    /// Validate `frame` against the session table and apply it.
    fn classify_frame(&self, kind: MessageKind, frame: &Frame) -> Result<ServerEvent, DropReason> {
        match kind {
            MessageKind::Start => {
                let start = StartMessage::decode(&frame.data).map_err(|_| DropReason::Malformed)?;
                let cipher = self.replies.cipher.clone();
                self.sessions
                    .open_with(start.session_id, || Reassembly::open(&start, cipher))?;
                Ok(ServerEvent::Opened(start.session_id))
            }
            MessageKind::Data => {
                let data = DataMessage::decode(&frame.data).map_err(|_| DropReason::Malformed)?;
                let id = data.session_id;
                self.sessions
                    .advance(id, |session| match session.accept(&data) {
                        Ok(Progress::Pending) => (Ok(ServerEvent::Progressed(id)), Retain::Keep),
                        Ok(Progress::Complete(payload)) => (
                            Ok(ServerEvent::Completed(Request {
                                session_id: id,
                                payload,
                                extra: session.extra(),
                            })),
                            Retain::Remove,
                        ),
                        Err(DropReason::ForgedTrailer) => {
                            (Err(DropReason::ForgedTrailer), Retain::Remove)
                        }
                        Err(reason) => (Err(reason), Retain::Keep),
                    })
                    .unwrap_or(Err(DropReason::UnknownSession))
            }
        }
    }

    /// Evict sessions idle for longer than the session timeout, as of `now`.
    pub fn sweep_at(&self, now: Instant) -> usize {
        sweep(&self.sessions, now, self.session_timeout)
    }

    /// Run the eviction sweep every sweep interval until [`Server::shutdown`].
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let timeout = self.session_timeout;
        let mut ticker = tokio::time::interval(self.sweep_interval);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        sweep(&sessions, Instant::now(), timeout);
                    }
                    _ = shutdown.changed() => break,
                }
            }
            log::debug!("Session sweeper stopped");
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

fn sweep(sessions: &SessionTable<Reassembly>, now: Instant, timeout: Duration) -> usize {
    let evicted = sessions.evict(|session| session.is_stale(now, timeout));
    for id in &evicted {
        log::debug!("Session {} timed out", id);
    }
    evicted.len()
}

#[async_trait]
impl FrameHandler for Server {
    fn message_ids(&self) -> Vec<u32> {
        vec![self.replies.ids.start, self.replies.ids.data]
    }

    async fn handle_frame(&self, frame: Frame) {
        if let Some(kind) = self.replies.ids.request_kind(frame.id) {
            self.handle(kind, &frame);
        }
    }
}
