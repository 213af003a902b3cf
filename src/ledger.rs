//! Bandwidth ledger
//!
//! Each accepted socket gets a [`LedgerEntry`] holding four directional byte
//! counters. Dropping the entry removes it from the ledger and emits the
//! closure events, so every entry produces exactly one `SocketClosed` no
//! matter where the connection failed.

use crate::connection::ConnectionId;
use crate::events::{ConnectionSummary, EventBus, ServerEvent};
use crate::socks::TargetAddr;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

/// Snapshot of the four counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrafficStats {
    /// Bytes read from the client
    pub received_from_client: u64,
    /// Bytes written to the client
    pub sent_to_client: u64,
    /// Bytes read from the destination
    pub received_from_destination: u64,
    /// Bytes written to the destination
    pub sent_to_destination: u64,
}

/// Live counters for one connection
#[derive(Debug, Default)]
pub struct TrafficCounters {
    received_from_client: AtomicU64,
    sent_to_client: AtomicU64,
    received_from_destination: AtomicU64,
    sent_to_destination: AtomicU64,
}

impl TrafficCounters {
    /// Count bytes read from the client
    pub fn add_received_from_client(&self, n: u64) {
        self.received_from_client.fetch_add(n, Ordering::Relaxed);
    }

    /// Count bytes written to the client
    pub fn add_sent_to_client(&self, n: u64) {
        self.sent_to_client.fetch_add(n, Ordering::Relaxed);
    }

    /// Count bytes read from the destination
    pub fn add_received_from_destination(&self, n: u64) {
        self.received_from_destination.fetch_add(n, Ordering::Relaxed);
    }

    /// Count bytes written to the destination
    pub fn add_sent_to_destination(&self, n: u64) {
        self.sent_to_destination.fetch_add(n, Ordering::Relaxed);
    }

    /// Current values
    pub fn snapshot(&self) -> TrafficStats {
        TrafficStats {
            received_from_client: self.received_from_client.load(Ordering::Relaxed),
            sent_to_client: self.sent_to_client.load(Ordering::Relaxed),
            received_from_destination: self.received_from_destination.load(Ordering::Relaxed),
            sent_to_destination: self.sent_to_destination.load(Ordering::Relaxed),
        }
    }
}

/// Metadata attached to an entry once the connection is accepted
#[derive(Debug, Clone)]
pub struct ConnectionMeta {
    /// Requested destination
    pub destination: TargetAddr,
    /// When the success reply was sent
    pub started_at: Instant,
    /// Authenticated username
    pub username: Option<String>,
}

/// Per-server map of live counters
#[derive(Debug)]
pub struct BandwidthLedger {
    entries: Mutex<HashMap<ConnectionId, Arc<TrafficCounters>>>,
    events: EventBus,
}

impl BandwidthLedger {
    /// Create a ledger that reports closures on `events`
    pub fn new(events: EventBus) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Open the entry for a freshly accepted socket
    pub fn open(self: &Arc<Self>, id: ConnectionId) -> LedgerEntry {
        let counters = Arc::new(TrafficCounters::default());
        self.lock().insert(id.clone(), counters.clone());

        LedgerEntry {
            ledger: self.clone(),
            id,
            counters,
            meta: None,
        }
    }

    /// Current counters of a live connection
    pub fn snapshot(&self, id: &ConnectionId) -> Option<TrafficStats> {
        self.lock().get(id).map(|counters| counters.snapshot())
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no entry is live
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Whether anyone is listening for events
    pub fn is_observed(&self) -> bool {
        self.events.subscriber_count() > 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<TrafficCounters>>> {
        // Counters stay consistent even if a holder panicked
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ServerEvent) {
        self.events.emit(event);
    }
}

/// Guard for one ledger entry
///
/// Owned by the connection task. Dropping it closes the entry.
#[derive(Debug)]
pub struct LedgerEntry {
    ledger: Arc<BandwidthLedger>,
    id: ConnectionId,
    counters: Arc<TrafficCounters>,
    meta: Option<ConnectionMeta>,
}

impl LedgerEntry {
    /// Connection identifier
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Shared counters for the relay
    pub fn counters(&self) -> Arc<TrafficCounters> {
        self.counters.clone()
    }

    /// Attach accept-stage metadata; closure will also emit `ConnectionClosed`
    pub fn attach(&mut self, meta: ConnectionMeta) {
        self.meta = Some(meta);
    }

    /// Whether metadata was attached
    pub fn is_attached(&self) -> bool {
        self.meta.is_some()
    }

    /// Whether anyone is listening for events
    pub fn is_observed(&self) -> bool {
        self.ledger.is_observed()
    }
}

impl Drop for LedgerEntry {
    fn drop(&mut self) {
        let stats = self.counters.snapshot();
        self.ledger.lock().remove(&self.id);

        if let Some(meta) = self.meta.take() {
            let duration = meta.started_at.elapsed();
            tracing::debug!(
                "Connection {} to {} closed after {:?}: {:?}",
                self.id,
                meta.destination,
                duration,
                stats
            );
            self.ledger
                .emit(ServerEvent::ConnectionClosed(ConnectionSummary {
                    id: self.id.clone(),
                    destination_host: meta.destination.host(),
                    destination_port: meta.destination.port(),
                    stats,
                    duration,
                    username: meta.username,
                }));
        }

        self.ledger.emit(ServerEvent::SocketClosed {
            id: self.id.clone(),
            stats,
        });
    }
}
