//! TCP relay for SOCKS5 CONNECT
//!
//! Copies bytes between the client and the outbound stream until either
//! direction finishes, then shuts down both write halves. The metered variant
//! routes both streams through [`MeteredStream`] so the four ledger counters
//! track every byte read and written.

use crate::ledger::TrafficCounters;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::debug;

/// Which end of the relay a metered stream faces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The SOCKS client
    Client,
    /// The destination (or upstream proxy)
    Destination,
}

/// Stream wrapper that counts bytes into [`TrafficCounters`]
#[derive(Debug)]
pub struct MeteredStream<S> {
    inner: S,
    side: Side,
    counters: Arc<TrafficCounters>,
}

impl<S> MeteredStream<S> {
    /// Wrap `inner`, counting as the given side
    pub fn new(inner: S, side: Side, counters: Arc<TrafficCounters>) -> Self {
        Self {
            inner,
            side,
            counters,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for MeteredStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = poll {
            let n = (buf.filled().len() - before) as u64;
            match self.side {
                Side::Client => self.counters.add_received_from_client(n),
                Side::Destination => self.counters.add_received_from_destination(n),
            }
        }
        poll
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for MeteredStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = poll {
            match self.side {
                Side::Client => self.counters.add_sent_to_client(n as u64),
                Side::Destination => self.counters.add_sent_to_destination(n as u64),
            }
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Relay without metering
///
/// `early_data` holds client bytes read before the relay started; they are
/// written to the outbound stream first.
pub async fn relay_direct<A, B>(client: A, outbound: B, early_data: &[u8]) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    relay(client, outbound, early_data).await
}

/// Relay while counting every byte into `counters`
pub async fn relay_metered<A, B>(
    client: A,
    outbound: B,
    early_data: &[u8],
    counters: Arc<TrafficCounters>,
) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    // Early bytes were read off the raw client socket
    counters.add_received_from_client(early_data.len() as u64);

    let client = MeteredStream::new(client, Side::Client, counters.clone());
    let outbound = MeteredStream::new(outbound, Side::Destination, counters);
    relay(client, outbound, early_data).await
}

async fn relay<A, B>(client: A, outbound: B, early_data: &[u8]) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);

    if !early_data.is_empty() {
        out_write.write_all(early_data).await?;
    }

    tokio::select! {
        result = tokio::io::copy(&mut client_read, &mut out_write) => {
            match result {
                Ok(bytes) => debug!("Client->Destination finished: {} bytes", bytes),
                Err(e) => debug!("Client->Destination error: {}", e),
            }
        }
        result = tokio::io::copy(&mut out_read, &mut client_write) => {
            match result {
                Ok(bytes) => debug!("Destination->Client finished: {} bytes", bytes),
                Err(e) => debug!("Destination->Client error: {}", e),
            }
        }
    }

    if let Err(e) = client_write.shutdown().await {
        debug!("Client shutdown error: {}", e);
    }
    if let Err(e) = out_write.shutdown().await {
        debug!("Destination shutdown error: {}", e);
    }

    Ok(())
}
