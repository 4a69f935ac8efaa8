//! Key client: fetches the symmetric key from the key server and follows its
//! rotations.

use async_trait::async_trait;
use canopy_protocol::crypto::{
    encode_key_request, verify_signature, Announcement, Cipher, StaticKeypair, TunnelKey,
    KEY_SHARE_SIZE,
};
use canopy_protocol::transport::Frame;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::{KexError, Result};
use crate::config::{KeyClientConfig, KeyClientIds};
use crate::network::FrameHandler;

/// What the client learned from the server's last announcement.
struct ServerKeys {
    announcement: Announcement,
    tunnel: TunnelKey,
}

pub struct KeyClient {
    keypair: StaticKeypair,
    cipher: Arc<Cipher>,
    outbound: mpsc::Sender<Frame>,
    ids: KeyClientIds,
    request_interval: Duration,
    server: Mutex<Option<ServerKeys>>,
    shutdown: watch::Sender<bool>,
}

impl KeyClient {
    pub fn new(
        cipher: Arc<Cipher>,
        outbound: mpsc::Sender<Frame>,
        config: KeyClientConfig,
    ) -> Self {
        let keypair = match config.static_secret {
            Some(secret) => StaticKeypair::from_secret_bytes(secret),
            None => StaticKeypair::generate(),
        };
        let (shutdown, _) = watch::channel(false);
        Self {
            keypair,
            cipher,
            outbound,
            ids: config.ids,
            request_interval: config.request_interval,
            server: Mutex::new(None),
            shutdown,
        }
    }

    fn server_keys(&self) -> MutexGuard<'_, Option<ServerKeys>> {
        self.server.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True while no tunnel key or no symmetric key is held.
    pub fn needs_key(&self) -> bool {
        self.server_keys().is_none() || !self.cipher.ok()
    }

    /// Announced Ed25519 verifying key of the key server.
    pub fn server_signing_key(&self) -> Option<[u8; 32]> {
        self.server_keys()
            .as_ref()
            .map(|keys| keys.announcement.signing_key)
    }

    /// Check a signature made by the key server.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool> {
        let signing_key = self.server_signing_key().ok_or(KexError::NotAnnounced)?;
        Ok(verify_signature(&signing_key, data, signature)?)
    }

    /// Send this client's key request to `id`.
    async fn request_on(&self, id: u32) -> Result<()> {
        let request = encode_key_request(&self.keypair.public_bytes());
        let frame = Frame::new(id, request.to_vec())?;
        self.outbound
            .send(frame)
            .await
            .map_err(|_| KexError::TransportClosed)
    }

    pub async fn request_key(&self) -> Result<()> {
        self.request_on(self.ids.request).await
    }

    /// Request a key every request interval while [`KeyClient::needs_key`],
    /// until [`KeyClient::shutdown`].
    pub fn spawn_request_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let client = self.clone();
        let mut ticker = tokio::time::interval(self.request_interval);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !client.needs_key() {
                            continue;
                        }
                        if let Err(e) = client.request_key().await {
                            log::warn!("Key request failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            log::debug!("Key request loop stopped");
        })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Store an announcement and derive the tunnel key from it.
    fn accept_announcement(&self, data: &[u8]) -> Result<()> {
        let announcement = Announcement::decode(data)?;
        let tunnel = self.keypair.derive_tunnel_key(&announcement.exchange_key)?;
        *self.server_keys() = Some(ServerKeys {
            announcement,
            tunnel,
        });
        Ok(())
    }

    /// Open a broadcast share and install the key.
    ///
    /// # Returns
    /// `false` if the share is not for this client
    fn accept_share(&self, data: &[u8]) -> Result<bool> {
        if data.len() != KEY_SHARE_SIZE {
            return Ok(false);
        }
        let key = match self.server_keys().as_ref() {
            Some(keys) => match keys.tunnel.open_share(data) {
                Ok(key) => key,
                Err(_) => return Ok(false),
            },
            None => return Err(KexError::NotAnnounced),
        };
        if self.cipher.update(&key[..])? {
            log::info!("Symmetric key installed");
        }
        Ok(true)
    }
}

#[async_trait]
impl FrameHandler for KeyClient {
    fn message_ids(&self) -> Vec<u32> {
        vec![self.ids.recv_pubkey, self.ids.recv_symmetric, self.ids.recv_rekey]
    }

    async fn handle_frame(&self, frame: Frame) {
        let result = if frame.id == self.ids.recv_pubkey {
            self.accept_announcement(&frame.data)
        } else if frame.id == self.ids.recv_symmetric {
            // Shares for other peers share the channel and are skipped quietly
            self.accept_share(&frame.data).map(|_| ())
        } else if frame.id == self.ids.recv_rekey {
            match self.accept_announcement(&frame.data) {
                Ok(()) => {
                    log::debug!("Rekey announced, requesting new key");
                    self.request_on(self.ids.rekey_request.unwrap_or(self.ids.request))
                        .await
                }
                Err(e) => Err(e),
            }
        } else {
            return;
        };

        if let Err(e) = result {
            log::debug!("Dropped key frame on {:#x}: {}", frame.id, e);
        }
    }
}
