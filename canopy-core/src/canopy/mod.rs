//! Canopy request/reply sessions over a frame bus.
//!
//! A [`Client`] and a [`Server`] share a symmetric key through their
//! [`Cipher`](canopy_protocol::crypto::Cipher) and agree on four message ids.
//! Both are [`FrameHandler`](crate::network::FrameHandler)s and are wired to
//! the bus through a [`Router`](crate::network::Router).

pub mod client;
pub mod server;
pub mod session;

pub use client::{Client, Reply, SendError};
pub use server::{ReplyBuilder, Request, Server};
pub use session::{DropReason, Progress, Reassembly, Retain, SessionTable};
