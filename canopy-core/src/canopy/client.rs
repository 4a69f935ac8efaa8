//! Canopy initiator.
//!
//! [`Client::send`] seals a request, writes its frames to the bus and waits
//! for the reply transfer that comes back under the same session id. Reply
//! frames for sessions this client did not open are dropped.

use async_trait::async_trait;
use canopy_protocol::crypto::{Cipher, CipherError};
use canopy_protocol::transport::Frame;
use canopy_protocol::wire::{
    DataMessage, ExtraData, MessageKind, SealedTransfer, SessionId, StartMessage, TransferError,
    MAX_PAYLOAD,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::session::{DropReason, Progress, Reassembly, Retain, SessionTable};
use crate::config::{CanopyConfig, MessageIds};
use crate::network::FrameHandler;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("No symmetric key available")]
    KeyUnavailable,
    #[error("No reply before the timeout")]
    Timeout,
    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("Session {0} is already in flight")]
    SessionInUse(SessionId),
    #[error("Cannot seal request: {0}")]
    Encoding(TransferError),
    #[error("Outbound frame queue closed")]
    TransportClosed,
}

impl From<TransferError> for SendError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::PayloadTooLarge { len, max } => SendError::PayloadTooLarge { len, max },
            TransferError::Cipher(CipherError::NoKey) => SendError::KeyUnavailable,
            other => SendError::Encoding(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SendError>;

/// A fully received and authenticated reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub session_id: SessionId,
    pub payload: Vec<u8>,
    /// Extra data from the reply's Start.
    pub extra: ExtraData,
}

enum ReplyState {
    AwaitingStart,
    Receiving(Reassembly),
    /// Reply delivered or its trailer was forged; later frames are noise.
    Finished,
}

/// Table entry of a send that is waiting for its reply.
struct PendingReply {
    state: ReplyState,
    waiter: Option<oneshot::Sender<Reply>>,
}

#[derive(Debug)]
enum ClientEvent {
    ReplyOpened(SessionId),
    Progressed(SessionId),
    Delivered(SessionId),
}

/// Removes a send's table entry however the send ends, including when the
/// caller drops the future.
struct SessionGuard<'a> {
    sessions: &'a SessionTable<PendingReply>,
    id: SessionId,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions.remove(self.id);
    }
}

pub struct Client {
    cipher: Arc<Cipher>,
    outbound: mpsc::Sender<Frame>,
    ids: MessageIds,
    reply_timeout: Duration,
    sessions: SessionTable<PendingReply>,
}

impl Client {
    /// # Arguments
    /// * `cipher` - Shared cipher, rotated by the key exchange
    /// * `outbound` - Queue toward the bus
    /// * `config` - Message ids and reply timeout
    pub fn new(cipher: Arc<Cipher>, outbound: mpsc::Sender<Frame>, config: &CanopyConfig) -> Self {
        Self {
            cipher,
            outbound,
            ids: config.message_ids,
            reply_timeout: config.reply_timeout,
            sessions: SessionTable::new(),
        }
    }

    /// Number of sends still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.sessions.len()
    }

    /// Send `payload` under a fresh random session id and wait for the reply.
    pub async fn send(&self, payload: &[u8]) -> Result<Vec<u8>> {
        self.send_with(payload, None, None)
            .await
            .map(|reply| reply.payload)
    }

    /// Send with an explicit session id and extra data.
    ///
    /// # Arguments
    /// * `payload` - Request bytes, at most [`MAX_PAYLOAD`]
    /// * `session_id` - Id to use; a random unused one when `None`
    /// * `extra` - Extra data for the request Start; zeros when `None`
    ///
    /// # Returns
    /// The reply, or [`SendError::Timeout`] if none completed in time
    pub async fn send_with(
        &self,
        payload: &[u8],
        session_id: Option<SessionId>,
        extra: Option<ExtraData>,
    ) -> Result<Reply> {
        if !self.cipher.ok() {
            return Err(SendError::KeyUnavailable);
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(SendError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let (waiter, reply) = oneshot::channel();
        let guard = self.register(session_id, waiter)?;
        let frames =
            SealedTransfer::seal(&self.cipher, guard.id, extra.unwrap_or_default(), payload)?
                .into_frames(self.ids.start, self.ids.data)?;

        let count = frames.len();
        for frame in frames {
            self.outbound
                .send(frame)
                .await
                .map_err(|_| SendError::TransportClosed)?;
        }
        log::debug!(
            "Session {} sent, {} bytes in {} frames",
            guard.id,
            payload.len(),
            count
        );

        match tokio::time::timeout(self.reply_timeout, reply).await {
            Ok(Ok(reply)) => Ok(reply),
            _ => {
                log::debug!("Session {} timed out waiting for reply", guard.id);
                Err(SendError::Timeout)
            }
        }
    }

    /// Claim a session id for a new send.
    fn register(
        &self,
        requested: Option<SessionId>,
        waiter: oneshot::Sender<Reply>,
    ) -> Result<SessionGuard<'_>> {
        let mut pending = PendingReply {
            state: ReplyState::AwaitingStart,
            waiter: Some(waiter),
        };

        let id = match requested {
            Some(id) => {
                if self.sessions.insert_new(id, pending).is_err() {
                    return Err(SendError::SessionInUse(id));
                }
                id
            }
            None => loop {
                let id = SessionId::random();
                match self.sessions.insert_new(id, pending) {
                    Ok(()) => break id,
                    Err(returned) => pending = returned,
                }
            },
        };

        Ok(SessionGuard {
            sessions: &self.sessions,
            id,
        })
    }

    /// Handle a frame from the reply Start channel.
    pub async fn on_reply_start_frame(&self, frame: &Frame) {
        self.handle(MessageKind::Start, frame);
    }

    /// Handle a frame from the reply Data channel.
    pub async fn on_reply_data_frame(&self, frame: &Frame) {
        self.handle(MessageKind::Data, frame);
    }

    fn handle(&self, kind: MessageKind, frame: &Frame) {
        match self.classify_frame(kind, frame) {
            Ok(ClientEvent::ReplyOpened(id)) => log::debug!("Reply for session {} opened", id),
            Ok(ClientEvent::Progressed(id)) => log::trace!("Reply for session {} advanced", id),
            Ok(ClientEvent::Delivered(id)) => log::debug!("Reply for session {} delivered", id),
            Err(reason) => log::debug!("Dropped reply {:?} frame: {:?}", kind, reason),
        }
    }

    fn classify_frame(
        &self,
        kind: MessageKind,
        frame: &Frame,
    ) -> std::result::Result<ClientEvent, DropReason> {
        match kind {
            MessageKind::Start => {
                let start = StartMessage::decode(&frame.data).map_err(|_| DropReason::Malformed)?;
                let id = start.session_id;
                self.sessions
                    .advance(id, |pending| match &pending.state {
                        ReplyState::AwaitingStart => {
                            match Reassembly::open(&start, self.cipher.clone()) {
                                Ok(session) => {
                                    pending.state = ReplyState::Receiving(session);
                                    (Ok(ClientEvent::ReplyOpened(id)), Retain::Keep)
                                }
                                Err(reason) => (Err(reason), Retain::Keep),
                            }
                        }
                        ReplyState::Receiving(_) => (Err(DropReason::DuplicateStart), Retain::Keep),
                        ReplyState::Finished => (Err(DropReason::Finished), Retain::Keep),
                    })
                    .unwrap_or(Err(DropReason::UnknownSession))
            }
            MessageKind::Data => {
                let data = DataMessage::decode(&frame.data).map_err(|_| DropReason::Malformed)?;
                let id = data.session_id;
                // The send's guard owns removal, so every branch keeps the entry
                self.sessions
                    .advance(id, |pending| {
                        let (result, extra) = match &mut pending.state {
                            ReplyState::AwaitingStart => {
                                return (Err(DropReason::NotOpen), Retain::Keep)
                            }
                            ReplyState::Finished => {
                                return (Err(DropReason::Finished), Retain::Keep)
                            }
                            ReplyState::Receiving(session) => {
                                (session.accept(&data), session.extra())
                            }
                        };
                        match result {
                            Ok(Progress::Pending) => {
                                (Ok(ClientEvent::Progressed(id)), Retain::Keep)
                            }
                            Ok(Progress::Complete(payload)) => {
                                pending.state = ReplyState::Finished;
                                if let Some(waiter) = pending.waiter.take() {
                                    let _ = waiter.send(Reply {
                                        session_id: id,
                                        payload,
                                        extra,
                                    });
                                }
                                (Ok(ClientEvent::Delivered(id)), Retain::Keep)
                            }
                            Err(DropReason::ForgedTrailer) => {
                                pending.state = ReplyState::Finished;
                                (Err(DropReason::ForgedTrailer), Retain::Keep)
                            }
                            Err(reason) => (Err(reason), Retain::Keep),
                        }
                    })
                    .unwrap_or(Err(DropReason::UnknownSession))
            }
        }
    }
}

#[async_trait]
impl FrameHandler for Client {
    fn message_ids(&self) -> Vec<u32> {
        vec![self.ids.reply_start, self.ids.reply_data]
    }

    async fn handle_frame(&self, frame: Frame) {
        if let Some(kind) = self.ids.reply_kind(frame.id) {
            self.handle(kind, &frame);
        }
    }
}
