//! # Socksgate - SOCKS5 proxy server
//!
//! Socksgate is a SOCKS5 (RFC 1928) proxy server with pluggable
//! authentication, a per-connection policy hook, optional chaining through an
//! upstream SOCKS5 proxy, and per-connection bandwidth accounting.
//!
//! ## Features
//!
//! - **Pluggable Authentication**: `AuthMethod` trait with built-in "no auth" and RFC 1929 username/password
//! - **Policy Hook**: deny, relay directly, or chain through an upstream proxy per request
//! - **Upstream Chaining**: outbound leg through another SOCKS5 server via `async-socks5`
//! - **Bandwidth Ledger**: four directional byte counters per connection, reported on close
//!
//! ## Usage
//!
//! ```rust,ignore
//! use socksgate::config::ServerConfig;
//! use socksgate::policy::{FnPolicy, PolicyDecision};
//! use socksgate::server::Server;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = Server::new(ServerConfig::default())?
//!         .with_policy(FnPolicy(|ctx: &socksgate::policy::PolicyContext| {
//!             if ctx.destination_port == 25 {
//!                 PolicyDecision::Deny
//!             } else {
//!                 PolicyDecision::allow()
//!             }
//!         }));
//!     let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     server.bind().await?.run(shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! accept -> ledger entry -> greeting -> auth -> request -> policy
//!        -> direct dial | upstream chain -> relay -> closure event
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod ledger;
pub mod policy;
pub mod server;
pub mod socks;
pub mod transport;
pub mod upstream;

// Re-export commonly used items
pub use config::{load_config, Config, ServerConfig};
pub use error::{GateError, RegistryError, Socks5Error, Socks5ReplyCode};
pub use events::{ConnectionSummary, EventBus, EventReceiver, ServerEvent};
pub use policy::{PolicyDecision, PolicyHook, UpstreamProxy};
pub use server::{Listening, Server};

/// Version of the Socksgate library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
