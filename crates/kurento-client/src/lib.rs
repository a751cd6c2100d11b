//! Kurento Media Server client.
//!
//! Speaks the Kurento JSON-RPC 2.0 protocol over a WebSocket and implements
//! [`rvoip_signaling_core::MediaBackend`] on top of it, so the call
//! orchestrator can drive a real media server.

// Error handling
pub mod error;

// Wire format
pub mod jsonrpc;

// Connection and request/response correlation
pub mod client;

// MediaBackend implementation
mod backend;

// Public exports
pub use client::{KurentoClient, KurentoConfig};
pub use error::{KurentoError, Result};
