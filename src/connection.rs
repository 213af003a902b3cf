//! Per-connection record
//!
//! A [`Connection`] is owned by the task serving one client socket and moves
//! through [`ConnectionState`] as the handshake progresses.

use crate::socks::auth::Credentials;
use crate::socks::TargetAddr;
use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(1);

/// Unique connection identifier: a process-wide counter plus a random suffix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        let seq = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        let suffix: u32 = rand::random();
        ConnectionId(format!("{}-{:08x}", seq, suffix))
    }

    /// Identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handshake progress of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    /// Waiting for the client greeting
    AwaitGreeting,
    /// A method was selected and its sub-negotiation is running
    AwaitAuthResult,
    /// Waiting for the client request
    AwaitRequest,
    /// Bytes are being relayed
    Relaying,
    /// Terminal state
    Closed,
}

impl ConnectionState {
    /// Whether moving from `self` to `next` follows the handshake order.
    ///
    /// Any state may close; otherwise states only advance one step.
    pub fn can_transition(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (AwaitGreeting, AwaitAuthResult)
                | (AwaitAuthResult, AwaitRequest)
                | (AwaitRequest, Relaying)
                | (AwaitGreeting | AwaitAuthResult | AwaitRequest | Relaying, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::AwaitGreeting => "await-greeting",
            ConnectionState::AwaitAuthResult => "await-auth-result",
            ConnectionState::AwaitRequest => "await-request",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One client session
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique identifier, shared with the ledger entry
    pub id: ConnectionId,
    /// Client address
    pub peer_addr: SocketAddr,
    /// Negotiated method identifier
    pub auth_method: Option<u8>,
    /// Credentials captured by the authentication method
    pub credentials: Option<Credentials>,
    /// Current state
    pub state: ConnectionState,
    /// Requested destination
    pub destination: Option<TargetAddr>,
    /// Accept time
    pub started_at: Instant,
}

impl Connection {
    /// Create a record for a freshly accepted socket
    pub fn new(id: ConnectionId, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            auth_method: None,
            credentials: None,
            state: ConnectionState::AwaitGreeting,
            destination: None,
            started_at: Instant::now(),
        }
    }

    /// Advance the state, logging out-of-order moves
    pub fn transition(&mut self, next: ConnectionState) {
        if !self.state.can_transition(next) {
            tracing::warn!(
                "Connection {}: unexpected transition {} -> {}",
                self.id,
                self.state,
                next
            );
        }
        tracing::trace!("Connection {}: {} -> {}", self.id, self.state, next);
        self.state = next;
    }

    /// Captured username, if any
    pub fn username(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.username.as_str())
    }

    /// Captured password, if any
    pub fn password(&self) -> Option<&str> {
        self.credentials.as_ref().map(|c| c.password.as_str())
    }
}
