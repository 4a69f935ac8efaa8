//! Endpoint configuration.
//!
//! Message ids are deployment data, not protocol logic: both ends of a
//! conversation must load the same [`MessageIds`]. Durations are written to
//! configuration files as milliseconds.

use canopy_protocol::wire::MessageKind;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Message id {0:#x} is assigned twice")]
    DuplicateId(u32),
    #[error("{0} must be non-zero")]
    ZeroValue(&'static str),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn ensure_distinct(ids: impl IntoIterator<Item = u32>) -> Result<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ConfigError::DuplicateId(id));
        }
    }
    Ok(())
}

fn ensure_non_zero(value: Duration, name: &'static str) -> Result<()> {
    if value.is_zero() {
        return Err(ConfigError::ZeroValue(name));
    }
    Ok(())
}

// ─── Canopy sessions ─────────────────────────────────────────────────────────

/// Bus message ids of the four Canopy channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageIds {
    /// Request Start, client to server.
    pub start: u32,
    /// Request Data, client to server.
    pub data: u32,
    /// Reply Start, server to client.
    pub reply_start: u32,
    /// Reply Data, server to client.
    pub reply_data: u32,
}

impl Default for MessageIds {
    fn default() -> Self {
        Self {
            start: 0x300,
            data: 0x301,
            reply_start: 0x302,
            reply_data: 0x303,
        }
    }
}

impl MessageIds {
    pub fn validate(&self) -> Result<()> {
        ensure_distinct([self.start, self.data, self.reply_start, self.reply_data])
    }

    /// Decoder for a frame on the request channel.
    pub fn request_kind(&self, id: u32) -> Option<MessageKind> {
        match id {
            id if id == self.start => Some(MessageKind::Start),
            id if id == self.data => Some(MessageKind::Data),
            _ => None,
        }
    }

    /// Decoder for a frame on the reply channel.
    pub fn reply_kind(&self, id: u32) -> Option<MessageKind> {
        match id {
            id if id == self.reply_start => Some(MessageKind::Start),
            id if id == self.reply_data => Some(MessageKind::Data),
            _ => None,
        }
    }
}

/// Canopy client and server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CanopyConfig {
    pub message_ids: MessageIds,
    /// Inactivity after which the sweep evicts a session.
    #[serde(rename = "session_timeout_ms", with = "millis")]
    pub session_timeout: Duration,
    /// Period of the eviction sweep.
    #[serde(rename = "sweep_interval_ms", with = "millis")]
    pub sweep_interval: Duration,
    /// How long `send` waits for a reply.
    #[serde(rename = "reply_timeout_ms", with = "millis")]
    pub reply_timeout: Duration,
    /// Capacity of bounded frame queues.
    pub frame_queue_depth: usize,
}

impl Default for CanopyConfig {
    fn default() -> Self {
        Self {
            message_ids: MessageIds::default(),
            session_timeout: Duration::from_secs(2),
            sweep_interval: Duration::from_secs(1),
            reply_timeout: Duration::from_secs(6),
            frame_queue_depth: 256,
        }
    }
}

impl CanopyConfig {
    /// Parse and validate a JSON document. Missing keys take defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.message_ids.validate()?;
        ensure_non_zero(self.session_timeout, "session_timeout")?;
        ensure_non_zero(self.sweep_interval, "sweep_interval")?;
        ensure_non_zero(self.reply_timeout, "reply_timeout")?;
        if self.frame_queue_depth == 0 {
            return Err(ConfigError::ZeroValue("frame_queue_depth"));
        }
        Ok(())
    }
}

// ─── Key exchange ────────────────────────────────────────────────────────────

/// Message ids a key-exchange client listens on and sends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyClientIds {
    /// Key server announcement (pubkey broadcast).
    pub recv_pubkey: u32,
    /// Sealed symmetric key shares.
    pub recv_symmetric: u32,
    /// Rekey notifications.
    pub recv_rekey: u32,
    /// Where this peer sends its key request.
    pub request: u32,
    /// Where this peer sends its request after a rekey; `request` if unset.
    #[serde(default)]
    pub rekey_request: Option<u32>,
}

impl KeyClientIds {
    pub fn validate(&self) -> Result<()> {
        let mut ids = vec![self.recv_pubkey, self.recv_symmetric, self.recv_rekey, self.request];
        if let Some(id) = self.rekey_request.filter(|id| *id != self.request) {
            ids.push(id);
        }
        ensure_distinct(ids)
    }
}

/// Message ids a key server listens on and sends to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyServerIds {
    pub pubkey_broadcast: u32,
    pub share_symmetric: u32,
    pub rekey_notify: u32,
    /// Empty frames here ask for a fresh announcement.
    pub pubkey_request: u32,
    /// Per-peer request ids, answered with announcement plus key share.
    #[serde(default)]
    pub symmetric_requests: HashMap<u32, String>,
    /// Per-peer rekey ids, answered with the key share only.
    #[serde(default)]
    pub rekey_requests: HashMap<u32, String>,
}

impl KeyServerIds {
    pub fn validate(&self) -> Result<()> {
        ensure_distinct(
            [
                self.pubkey_broadcast,
                self.share_symmetric,
                self.rekey_notify,
                self.pubkey_request,
            ]
            .into_iter()
            .chain(self.symmetric_requests.keys().copied())
            .chain(self.rekey_requests.keys().copied()),
        )
    }
}

fn default_request_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_resync_interval() -> Duration {
    Duration::from_secs(10)
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyClientConfig {
    pub ids: KeyClientIds,
    /// Period of the key-request loop while no key is held.
    #[serde(
        rename = "request_interval_ms",
        with = "millis",
        default = "default_request_interval"
    )]
    pub request_interval: Duration,
    /// Stored X25519 secret; a fresh one is generated when absent.
    #[serde(skip)]
    pub static_secret: Option<[u8; 32]>,
}

impl KeyClientConfig {
    pub fn new(ids: KeyClientIds) -> Self {
        Self {
            ids,
            request_interval: default_request_interval(),
            static_secret: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.ids.validate()?;
        ensure_non_zero(self.request_interval, "request_interval")
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeyServerConfig {
    pub ids: KeyServerIds,
    /// Period between symmetric key rotations.
    #[serde(
        rename = "resync_interval_ms",
        with = "millis",
        default = "default_resync_interval"
    )]
    pub resync_interval: Duration,
    /// Stored X25519 secret; a fresh one is generated when absent.
    #[serde(skip)]
    pub static_secret: Option<[u8; 32]>,
    /// Stored Ed25519 signing key; a fresh one is generated when absent.
    #[serde(skip)]
    pub signing_key: Option<[u8; 32]>,
}

impl KeyServerConfig {
    pub fn new(ids: KeyServerIds) -> Self {
        Self {
            ids,
            resync_interval: default_resync_interval(),
            static_secret: None,
            signing_key: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.ids.validate()?;
        ensure_non_zero(self.resync_interval, "resync_interval")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CanopyConfig::default();
        assert_eq!(config.session_timeout, Duration::from_secs(2));
        assert_eq!(config.sweep_interval, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json_partial() {
        let config = CanopyConfig::from_json(
            r#"{
                "message_ids": {"start": 16, "data": 17, "reply_start": 18, "reply_data": 19},
                "reply_timeout_ms": 1500
            }"#,
        )
        .unwrap();
        assert_eq!(config.message_ids.data, 17);
        assert_eq!(config.reply_timeout, Duration::from_millis(1500));
        assert_eq!(config.session_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let result = CanopyConfig::from_json(
            r#"{"message_ids": {"start": 1, "data": 2, "reply_start": 2, "reply_data": 3}}"#,
        );
        assert!(matches!(result, Err(ConfigError::DuplicateId(2))));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let result = CanopyConfig::from_json(r#"{"session_timeout_ms": 0}"#);
        assert!(matches!(result, Err(ConfigError::ZeroValue("session_timeout"))));
    }

    #[test]
    fn test_kind_lookup() {
        let ids = MessageIds::default();
        assert_eq!(ids.request_kind(ids.start), Some(MessageKind::Start));
        assert_eq!(ids.request_kind(ids.reply_data), None);
        assert_eq!(ids.reply_kind(ids.reply_data), Some(MessageKind::Data));
    }

    #[test]
    fn test_key_server_ids_from_json() {
        let config = KeyServerConfig::from_json(
            r#"{
                "ids": {
                    "pubkey_broadcast": 32, "share_symmetric": 33, "rekey_notify": 34,
                    "pubkey_request": 35,
                    "symmetric_requests": {"40": "door", "41": "engine"},
                    "rekey_requests": {"50": "door"}
                },
                "resync_interval_ms": 5000
            }"#,
        )
        .unwrap();
        assert_eq!(config.ids.symmetric_requests.get(&41).map(String::as_str), Some("engine"));
        assert_eq!(config.resync_interval, Duration::from_secs(5));
        assert!(config.static_secret.is_none());
    }

    #[test]
    fn test_key_ids_collide() {
        let mut ids = KeyServerIds {
            pubkey_broadcast: 1,
            share_symmetric: 2,
            rekey_notify: 3,
            pubkey_request: 4,
            symmetric_requests: HashMap::new(),
            rekey_requests: HashMap::new(),
        };
        assert!(ids.validate().is_ok());
        ids.rekey_requests.insert(2, "peer".into());
        assert!(matches!(ids.validate(), Err(ConfigError::DuplicateId(2))));

        let client = KeyClientIds {
            recv_pubkey: 1,
            recv_symmetric: 2,
            recv_rekey: 3,
            request: 4,
            rekey_request: Some(4),
        };
        assert!(client.validate().is_ok());
    }
}
