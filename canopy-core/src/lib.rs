// Crate-level lint configuration: suppress stylistic warnings that don't affect correctness.
#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::too_many_arguments,
    clippy::type_complexity
)]

// ── Re-export Canopy protocol modules ───────────────────────────────────────
// The wire format and cryptography live in the standalone `canopy-protocol`
// crate; runtime code refers to them as `crate::wire::…` and friends.
pub use canopy_protocol::crypto;
pub use canopy_protocol::transport;
pub use canopy_protocol::wire;

// ── Runtime modules ─────────────────────────────────────────────────────────
pub mod canopy;
pub mod config;
pub mod kex;
pub mod network;

// ── Re-export main types ────────────────────────────────────────────────────
pub use canopy::{Client, Reply, ReplyBuilder, Request, SendError, Server};
pub use config::{CanopyConfig, ConfigError, KeyClientConfig, KeyServerConfig, MessageIds};
pub use crypto::Cipher;
pub use kex::{KexError, KeyClient, KeyServer};
pub use network::{BusPort, FrameHandler, LoopbackBus, Router};
pub use transport::Frame;

// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version
pub fn get_version() -> &'static str {
    VERSION
}
