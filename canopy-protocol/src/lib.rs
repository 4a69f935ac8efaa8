//! # Canopy Protocol
//!
//! **Authenticated, chunked session transport for CAN-FD sized frames.**
//!
//! Canopy carries arbitrarily sized, end-to-end encrypted messages over a
//! broadcast bus whose frames hold 64 bytes. This crate is the pure,
//! synchronous half: it knows how to build, parse, seal and open messages,
//! but never touches a bus or a clock.
//!
//! ## Quick Start
//!
//! ```rust
//! use canopy_protocol::crypto::Cipher;
//! use canopy_protocol::wire::{open_trailer, ExtraData, SealedTransfer, SessionId};
//!
//! let cipher = Cipher::with_key(&[7u8; 32]).unwrap();
//! let transfer =
//!     SealedTransfer::seal(&cipher, SessionId::random(), ExtraData::default(), b"hello").unwrap();
//!
//! let mut buffer = Vec::new();
//! for chunk in &transfer.chunks {
//!     buffer.extend(chunk.open(&cipher).unwrap());
//! }
//! assert_eq!(open_trailer(&cipher, buffer).unwrap(), b"hello");
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`wire`] | Typed fields, Start/Data messages, transfer sealing and the trailing tag |
//! | [`crypto`] | Two-generation AEAD cipher, X25519/HKDF key exchange primitives |
//! | [`transport`] | Frame type, CAN-FD payload budget, SocketCAN codec |

// Crate-level lint configuration: suppress stylistic warnings that don't affect correctness.
#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

// ── Public modules ──────────────────────────────────────────────────────────

/// Two-generation AEAD cipher and key-exchange primitives.
pub mod crypto;

/// Frame type and the SocketCAN codec.
pub mod transport;

/// Wire fields, messages and transfer sealing.
pub mod wire;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use crypto::{Cipher, CipherError};
pub use transport::{Frame, FrameError, MAX_FRAME_PAYLOAD};
pub use wire::{
    DataMessage, ExtraData, MessageKind, SealedTransfer, SessionId, SessionMessage, StartMessage,
};

// ── Library metadata ────────────────────────────────────────────────────────

/// Canopy protocol crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the crate version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────
