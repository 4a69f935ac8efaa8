//! Symmetric key distribution.
//!
//! A [`KeyServer`] owns the symmetric key of a bus segment and hands it to
//! every [`KeyClient`] that proves nothing beyond knowing an X25519 public
//! key: shares are sealed under a per-peer tunnel key, so only the requesting
//! peer can open them. The server rotates the key periodically and clients
//! follow; both ends install keys into the same [`Cipher`] the Canopy
//! sessions use.
//!
//! [`Cipher`]: canopy_protocol::crypto::Cipher

pub mod client;
pub mod server;

pub use client::KeyClient;
pub use server::KeyServer;

use canopy_protocol::crypto::{CipherError, KeyExchangeError};
use canopy_protocol::transport::FrameError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KexError {
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),
    #[error("Key exchange error: {0}")]
    KeyExchange(#[from] KeyExchangeError),
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("Key server has not announced itself")]
    NotAnnounced,
    #[error("Outbound frame queue closed")]
    TransportClosed,
}

pub type Result<T> = std::result::Result<T, KexError>;
