//! # shot-cluster
//!
//! Cluster flow control for `shot-guard`. A token server owns the global
//! counters for every cluster flow; each process asks it for tokens instead
//! of counting locally.
//!
//! * [`TokenServer`] serves a [`DefaultTokenService`] over TCP.
//! * [`ClusterTokenClient`] pipelines requests to a server over a single
//!   connection and reconnects in the background.
//!
//! Both sides implement [`shot_guard::TokenService`], so an engine can use a
//! remote server through the client or an embedded one directly.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use shot_cluster::ClientConfig;
//! use shot_cluster::ClusterTokenClient;
//! use shot_guard::Engine;
//! use shot_guard::EngineConfig;
//!
//! # async fn connect() -> Result<(), shot_guard::GuardError> {
//! let engine = Engine::new(EngineConfig::default())?;
//! let client = ClusterTokenClient::new(
//!     ClientConfig::new("10.0.0.7:18730").with_request_timeout(Duration::from_millis(20)),
//! );
//! client.start();
//! engine.set_token_service(Arc::new(client));
//! # Ok(())
//! # }
//! ```
//!
//! The wire format lives in [`codec`].

pub mod codec;

mod client;
mod error;
mod server;

pub use client::ClientConfig;
pub use client::ClusterTokenClient;
pub use error::ClusterError;
pub use error::ProtocolError;
pub use server::DefaultTokenService;
pub use server::ServerConfig;
pub use server::TokenServer;
