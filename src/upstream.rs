//! Outbound connector
//!
//! Opens the outbound leg of a relay, either straight to the destination or
//! through an upstream SOCKS5 proxy using `async-socks5`.

use crate::error::Socks5ReplyCode;
use crate::policy::UpstreamProxy;
use crate::socks::TargetAddr;
use crate::transport::SocketOpts;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// Errors raised while opening the outbound leg
#[derive(Error, Debug)]
pub enum DialError {
    /// DNS lookup failed
    #[error("Failed to resolve {host}: {source}")]
    Resolve {
        /// Host being resolved
        host: String,
        /// Resolver error
        source: io::Error,
    },

    /// DNS lookup returned nothing
    #[error("No addresses found for {0}")]
    NoAddresses(String),

    /// TCP connect failed
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        /// Address dialed
        addr: SocketAddr,
        /// Socket error
        source: io::Error,
    },

    /// The upstream proxy handshake failed
    #[error("Upstream proxy {proxy} failed: {source}")]
    Upstream {
        /// Upstream proxy address
        proxy: String,
        /// Client handshake error
        source: async_socks5::Error,
    },

    /// `connect_timeout` elapsed
    #[error("Connection timeout")]
    Timeout,
}

impl DialError {
    /// Reply code reported to the client for a direct dial failure
    pub fn reply_code(&self) -> Socks5ReplyCode {
        match self {
            DialError::Resolve { .. } | DialError::NoAddresses(_) | DialError::Timeout => {
                Socks5ReplyCode::HostUnreachable
            }
            DialError::Connect { source, .. } => Socks5ReplyCode::from(source),
            DialError::Upstream { .. } => Socks5ReplyCode::ConnectionNotAllowed,
        }
    }
}

/// Resolve and connect to the destination
pub async fn dial_direct(
    target: &TargetAddr,
    opts: &SocketOpts,
    timeout: Option<Duration>,
) -> Result<TcpStream, DialError> {
    with_timeout(timeout, async {
        let addr = match target {
            TargetAddr::Ip(addr) => *addr,
            TargetAddr::Domain(host, port) => resolve(host, *port).await?,
        };
        connect(addr, opts).await
    })
    .await
}

/// Connect to `proxy` and ask it to CONNECT to `target`
pub async fn dial_via_proxy(
    proxy: &UpstreamProxy,
    target: &TargetAddr,
    opts: &SocketOpts,
    timeout: Option<Duration>,
) -> Result<TcpStream, DialError> {
    with_timeout(timeout, async {
        let addr = resolve(&proxy.host, proxy.port).await?;
        let mut stream = connect(addr, opts).await?;

        let auth = proxy.auth.as_ref().map(|auth| async_socks5::Auth {
            username: auth.username.clone(),
            password: auth.password.clone(),
        });

        async_socks5::connect(&mut stream, target, auth)
            .await
            .map_err(|source| DialError::Upstream {
                proxy: proxy.to_string(),
                source,
            })?;
        debug!("Upstream {} connected to {}", proxy, target);

        Ok::<_, DialError>(stream)
    })
    .await
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, DialError> {
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|source| DialError::Resolve {
            host: host.to_string(),
            source,
        })?;
    addrs
        .next()
        .ok_or_else(|| DialError::NoAddresses(host.to_string()))
}

async fn connect(addr: SocketAddr, opts: &SocketOpts) -> Result<TcpStream, DialError> {
    debug!("Connecting to {}", addr);
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|source| DialError::Connect { addr, source })?;

    if let Err(e) = opts.apply(&stream) {
        debug!("Failed to apply socket options to {}: {}", addr, e);
    }
    Ok(stream)
}

async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T, DialError>
where
    F: Future<Output = Result<T, DialError>>,
{
    match timeout {
        Some(duration) => tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| DialError::Timeout)?,
        None => fut.await,
    }
}
