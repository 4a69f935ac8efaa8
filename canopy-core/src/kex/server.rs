//! Key server: owns the symmetric key and shares it with requesting peers.

use async_trait::async_trait;
use canopy_protocol::crypto::{
    decode_key_request, generate_key, Announcement, Cipher, SigningIdentity, StaticKeypair,
    SymmetricKey,
};
use canopy_protocol::transport::Frame;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};

use super::{KexError, Result};
use crate::config::{KeyServerConfig, KeyServerIds};
use crate::network::FrameHandler;

pub struct KeyServer {
    keypair: StaticKeypair,
    identity: SigningIdentity,
    /// Key handed out in shares; always equal to the cipher's current key.
    symmetric: Mutex<SymmetricKey>,
    cipher: Arc<Cipher>,
    outbound: mpsc::Sender<Frame>,
    ids: KeyServerIds,
    resync_interval: Duration,
    shutdown: watch::Sender<bool>,
}

impl KeyServer {
    /// Create a key server and install a fresh symmetric key into `cipher`.
    ///
    /// # Arguments
    /// * `cipher` - Cipher shared with this node's Canopy endpoints
    /// * `outbound` - Queue toward the bus
    /// * `config` - Message ids, rotation period and stored identity keys
    pub fn new(
        cipher: Arc<Cipher>,
        outbound: mpsc::Sender<Frame>,
        config: KeyServerConfig,
    ) -> Result<Self> {
        let keypair = match config.static_secret {
            Some(secret) => StaticKeypair::from_secret_bytes(secret),
            None => StaticKeypair::generate(),
        };
        let identity = match config.signing_key {
            Some(bytes) => SigningIdentity::from_bytes(&bytes),
            None => SigningIdentity::generate(),
        };

        let key = generate_key();
        cipher.update(&key[..])?;
        let (shutdown, _) = watch::channel(false);

        log::info!(
            "Key server ready: {} symmetric peers, {} rekey peers",
            config.ids.symmetric_requests.len(),
            config.ids.rekey_requests.len()
        );

        Ok(Self {
            keypair,
            identity,
            symmetric: Mutex::new(key),
            cipher,
            outbound,
            ids: config.ids,
            resync_interval: config.resync_interval,
            shutdown,
        })
    }

    /// Public keys this server broadcasts.
    pub fn announcement(&self) -> Announcement {
        Announcement {
            exchange_key: self.keypair.public_bytes(),
            signing_key: self.identity.verifying_key_bytes(),
        }
    }

    /// Sign `data` with the announced Ed25519 identity.
    pub fn sign(&self, data: &[u8]) -> [u8; 64] {
        self.identity.sign(data)
    }

    fn current_key(&self) -> SymmetricKey {
        self.symmetric
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn send(&self, id: u32, data: Vec<u8>) -> Result<()> {
        let frame = Frame::new(id, data)?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| KexError::TransportClosed)
    }

    async fn broadcast_announcement(&self, id: u32) -> Result<()> {
        self.send(id, self.announcement().encode().to_vec()).await
    }

    /// Replace the symmetric key and tell every peer to fetch it.
    ///
    /// The cipher and the shared key are both switched before the
    /// notification goes out, so a peer that reacts instantly is handed the
    /// new key. A failed notification leaves the rotation in place.
    pub async fn rotate(&self) -> Result<()> {
        let key = generate_key();
        self.cipher.update(&key[..])?;
        *self.symmetric.lock().unwrap_or_else(PoisonError::into_inner) = key;
        log::info!("Symmetric key rotated");

        if let Err(e) = self.broadcast_announcement(self.ids.rekey_notify).await {
            log::warn!("Rekey notification not sent: {}", e);
            return Err(e);
        }
        Ok(())
    }

    /// Rotate every resync interval until [`KeyServer::shutdown`].
    pub fn spawn_rekey_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let server = self.clone();
        let mut ticker = interval_at(Instant::now() + self.resync_interval, self.resync_interval);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = server.rotate().await {
                            log::error!("Key rotation failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            log::debug!("Rekey loop stopped");
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Answer a key request from `peer`.
    ///
    /// # Arguments
    /// * `peer` - Configured name of the requesting peer, for logs
    /// * `request` - `pubkey || digest` from the peer
    /// * `announce` - Broadcast the announcement before the share
    async fn answer(&self, peer: &str, request: &[u8], announce: bool) -> Result<()> {
        let their_public = decode_key_request(request)?;
        let tunnel = self.keypair.derive_tunnel_key(&their_public)?;
        let share = tunnel.seal_share(&self.current_key())?;

        if announce {
            self.broadcast_announcement(self.ids.pubkey_broadcast).await?;
        }
        self.send(self.ids.share_symmetric, share).await?;
        log::debug!("Shared symmetric key with {}", peer);
        Ok(())
    }
}

#[async_trait]
impl FrameHandler for KeyServer {
    fn message_ids(&self) -> Vec<u32> {
        std::iter::once(self.ids.pubkey_request)
            .chain(self.ids.symmetric_requests.keys().copied())
            .chain(self.ids.rekey_requests.keys().copied())
            .collect()
    }

    async fn handle_frame(&self, frame: Frame) {
        let result = if frame.id == self.ids.pubkey_request {
            if !frame.data.is_empty() {
                log::debug!("Ignored non-empty public key request");
                return;
            }
            self.broadcast_announcement(self.ids.pubkey_broadcast).await
        } else if let Some(peer) = self.ids.symmetric_requests.get(&frame.id) {
            self.answer(peer, &frame.data, true).await
        } else if let Some(peer) = self.ids.rekey_requests.get(&frame.id) {
            self.answer(peer, &frame.data, false).await
        } else {
            return;
        };

        match result {
            Ok(()) => {}
            Err(KexError::TransportClosed) => {
                log::warn!("Outbound queue closed, key reply dropped")
            }
            Err(e) => log::debug!("Dropped key request on {:#x}: {}", frame.id, e),
        }
    }
}
