//! SOCKS5 module for Socksgate
//!
//! This module implements the server side of the SOCKS5 protocol: the
//! handshake state machine, pluggable authentication, the CONNECT decision
//! token and the TCP relay.

pub mod auth;
pub mod codec;
pub mod command;
pub mod consts;
pub mod handshake;
pub mod request;
pub mod tcp_relay;
pub mod types;

pub use auth::{AuthMethod, AuthRegistry, Credentials, NoAuth, PasswordAuth};
pub use handshake::negotiate;
pub use request::{InterceptedClient, PendingRequest};
pub use tcp_relay::{relay_direct, relay_metered, MeteredStream};
pub use types::{SocksCommand, TargetAddr};
