//! CONNECT request decision token
//!
//! A [`PendingRequest`] is the only handle to a connection that has finished
//! its handshake. Every decision method takes `self` by value, so a request is
//! accepted or denied at most once:
//!
//! ```compile_fail
//! use socksgate::socks::PendingRequest;
//!
//! async fn deny_twice(request: PendingRequest<tokio::net::TcpStream>) {
//!     let _ = request.deny().await;
//!     let _ = request.deny().await;
//! }
//! ```

use super::command::{build_reply, send_not_allowed, send_success};
use super::consts::MAX_EARLY_DATA;
use super::tcp_relay::{relay_direct, relay_metered};
use super::types::TargetAddr;
use crate::connection::{Connection, ConnectionState};
use crate::error::{GateError, Socks5Error};
use crate::ledger::{ConnectionMeta, LedgerEntry};
use crate::policy::PolicyContext;
use crate::transport::SocketOpts;
use crate::upstream::dial_direct;
use bytes::BytesMut;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, warn};

/// A parsed CONNECT request awaiting a decision
#[derive(Debug)]
pub struct PendingRequest<S> {
    stream: S,
    conn: Connection,
    entry: LedgerEntry,
    target: TargetAddr,
    early_data: BytesMut,
}

impl<S> PendingRequest<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub(crate) fn new(stream: S, conn: Connection, entry: LedgerEntry, target: TargetAddr) -> Self {
        Self {
            stream,
            conn,
            entry,
            target,
            early_data: BytesMut::new(),
        }
    }

    /// Connection record
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Requested destination
    pub fn target(&self) -> &TargetAddr {
        &self.target
    }

    /// Client bytes received so far after the request
    pub fn early_data(&self) -> &[u8] {
        &self.early_data
    }

    /// Request record handed to the policy hook
    pub fn policy_context(&self) -> PolicyContext {
        PolicyContext {
            connection_id: self.conn.id.clone(),
            source: self.conn.peer_addr,
            username: self.conn.username().map(str::to_string),
            password: self.conn.password().map(str::to_string),
            destination_host: self.target.host(),
            destination_port: self.target.port(),
        }
    }

    /// Drive `fut` while watching the client socket.
    ///
    /// Bytes the client sends meanwhile are kept (up to `MAX_EARLY_DATA`) and
    /// forwarded once a relay starts. If the client closes first, `fut` is
    /// dropped and [`Socks5Error::ClientClosed`] is returned.
    pub async fn guard<F: Future>(&mut self, fut: F) -> Result<F::Output, Socks5Error> {
        tokio::pin!(fut);
        let mut chunk = [0u8; 4096];

        loop {
            let room = MAX_EARLY_DATA.saturating_sub(self.early_data.len());
            if room == 0 {
                // Stop reading; the client is held back by TCP flow control
                return Ok(fut.await);
            }
            let limit = room.min(chunk.len());

            tokio::select! {
                output = &mut fut => return Ok(output),
                read = self.stream.read(&mut chunk[..limit]) => match read {
                    Ok(0) => {
                        debug!("Connection {}: client closed while pending", self.conn.id);
                        return Err(Socks5Error::ClientClosed);
                    }
                    Ok(n) => self.early_data.extend_from_slice(&chunk[..n]),
                    Err(e) => return Err(e.into()),
                },
            }
        }
    }

    /// Refuse with "connection not allowed by ruleset" and close
    pub async fn deny(mut self) -> io::Result<()> {
        debug!("Connection {}: denied {}", self.conn.id, self.target);
        self.conn.transition(ConnectionState::Closed);
        send_not_allowed(&mut self.stream).await
    }

    /// Write a success reply echoing `bound` and take over the client stream
    pub async fn accept_intercept(
        mut self,
        bound: Option<SocketAddr>,
    ) -> io::Result<InterceptedClient<S>> {
        send_success(&mut self.stream, bound).await?;

        self.entry.attach(ConnectionMeta {
            destination: self.target.clone(),
            started_at: Instant::now(),
            username: self.conn.username().map(str::to_string),
        });
        self.conn.transition(ConnectionState::Relaying);

        Ok(InterceptedClient {
            stream: self.stream,
            conn: self.conn,
            entry: self.entry,
            early_data: self.early_data,
        })
    }

    /// Dial the destination directly, reply, and relay until either side closes.
    ///
    /// The relay is metered only while someone is subscribed to server events.
    pub async fn accept_relay(
        mut self,
        opts: &SocketOpts,
        timeout: Option<Duration>,
    ) -> Result<(), GateError> {
        let target = self.target.clone();

        let outbound = match self.guard(dial_direct(&target, opts, timeout)).await? {
            Ok(outbound) => outbound,
            Err(e) => {
                warn!("Connection {}: {}", self.conn.id, e);
                self.conn.transition(ConnectionState::Closed);
                build_reply(&mut self.stream, e.reply_code(), None).await?;
                return Err(e.into());
            }
        };

        let bound = outbound.local_addr().ok();
        let metered = self.entry.is_observed();
        let client = self.accept_intercept(bound).await?;
        debug!(
            "Connection {}: relaying to {} (metered: {})",
            client.conn.id, target, metered
        );

        if metered {
            client.relay_metered(outbound).await?;
        } else {
            client.relay_direct(outbound).await?;
        }
        Ok(())
    }
}

/// Client stream after a success reply, owned by the caller
#[derive(Debug)]
pub struct InterceptedClient<S> {
    stream: S,
    conn: Connection,
    entry: LedgerEntry,
    early_data: BytesMut,
}

impl<S> InterceptedClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Connection record
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Client bytes received before the reply
    pub fn early_data(&self) -> &[u8] {
        &self.early_data
    }

    /// Relay to `outbound`, counting into the ledger entry
    pub async fn relay_metered<O>(mut self, outbound: O) -> io::Result<()>
    where
        O: AsyncRead + AsyncWrite + Unpin,
    {
        let result = relay_metered(
            &mut self.stream,
            outbound,
            &self.early_data,
            self.entry.counters(),
        )
        .await;
        self.conn.transition(ConnectionState::Closed);
        result
    }

    /// Relay to `outbound` without counting
    pub async fn relay_direct<O>(mut self, outbound: O) -> io::Result<()>
    where
        O: AsyncRead + AsyncWrite + Unpin,
    {
        let result = relay_direct(&mut self.stream, outbound, &self.early_data).await;
        self.conn.transition(ConnectionState::Closed);
        result
    }

    /// Take the raw parts. The ledger entry closes when the returned guard drops.
    pub fn into_parts(self) -> (S, BytesMut, LedgerEntry) {
        (self.stream, self.early_data, self.entry)
    }
}
