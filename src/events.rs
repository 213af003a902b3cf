//! Server notifications
//!
//! Delivered through an [`EventBus`]. Every subscriber owns an unbounded
//! queue, so an event emitted while a subscriber is alive is never dropped,
//! however far behind the subscriber falls. A subscriber that stops reading
//! keeps its backlog in memory until its receiver is dropped.

use crate::connection::ConnectionId;
use crate::ledger::TrafficStats;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

/// Receiving half of a subscription
pub type EventReceiver = mpsc::UnboundedReceiver<ServerEvent>;

/// Event emitted by the server
#[derive(Debug, Clone, Serialize)]
pub enum ServerEvent {
    /// The listener is bound
    Listening(SocketAddr),

    /// A ledger entry was released. Emitted for every accepted socket.
    SocketClosed {
        /// Connection identifier
        id: ConnectionId,
        /// Final counters
        stats: TrafficStats,
    },

    /// A connection that reached the accept stage closed
    ConnectionClosed(ConnectionSummary),

    /// Listener-level transport failure
    TransportError(String),
}

/// Final accounting for a connection that was accepted
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    /// Connection identifier
    pub id: ConnectionId,
    /// Requested destination host
    pub destination_host: String,
    /// Requested destination port
    pub destination_port: u16,
    /// Final counters
    pub stats: TrafficStats,
    /// Time from the success reply to close
    pub duration: Duration,
    /// Authenticated username, if any
    pub username: Option<String>,
}

/// Fan-out of server events to every live subscriber
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ServerEvent>>>>,
}

impl EventBus {
    /// Create a bus with no subscribers
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. It sees every event emitted from now on.
    pub fn subscribe(&self) -> EventReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver `event` to every subscriber, forgetting those that are gone
    pub fn emit(&self, event: ServerEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of subscribers whose receiver is still alive
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<ServerEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
