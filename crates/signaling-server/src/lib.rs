//! # rvoip-signaling-server
//!
//! WebSocket front end of the call broker. Browsers connect to `/ws`, get a
//! session id and exchange call signaling; the media side is handled by a
//! [`MediaBackend`](rvoip_signaling_core::MediaBackend), normally a Kurento
//! connection.
//!
//! ```no_run
//! use std::sync::Arc;
//! use rvoip_kurento_client::KurentoClient;
//! use rvoip_signaling_server::{ServerConfig, SignalingServer};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ServerConfig::default();
//! let kurento = KurentoClient::connect(config.kurento.clone()).await?;
//! let server = SignalingServer::new(config, kurento);
//! let listener = server.bind().await?;
//! server.run(listener, async { let _ = tokio::signal::ctrl_c().await; }).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod server;
mod transport;

pub use config::{Cli, ServerConfig};
pub use server::{build_router, AppState, SignalingServer};
