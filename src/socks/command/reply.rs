//! SOCKS5 reply builder
//!
//! Constructs SOCKS5 reply messages.

use crate::error::Socks5ReplyCode;
use crate::socks::consts::*;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Encode a SOCKS5 reply
///
/// # SOCKS5 Reply Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// A missing bound address is encoded as `0.0.0.0:0`.
pub fn encode_reply(reply_code: Socks5ReplyCode, bind_addr: Option<SocketAddr>) -> Vec<u8> {
    let bind_addr =
        bind_addr.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));

    let mut reply = vec![SOCKS5_VERSION, reply_code.into(), SOCKS5_RESERVED];

    match bind_addr {
        SocketAddr::V4(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        SocketAddr::V6(addr) => {
            reply.push(SOCKS5_ADDR_TYPE_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
    }

    reply
}

/// Build and send a SOCKS5 reply
pub async fn build_reply<S>(
    stream: &mut S,
    reply_code: Socks5ReplyCode,
    bind_addr: Option<SocketAddr>,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    stream
        .write_all(&encode_reply(reply_code, bind_addr))
        .await?;
    stream.flush().await
}

/// Build a success reply
pub async fn send_success<S>(stream: &mut S, bind_addr: Option<SocketAddr>) -> io::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    build_reply(stream, Socks5ReplyCode::Succeeded, bind_addr).await
}

/// Build a "connection not allowed by ruleset" reply
pub async fn send_not_allowed<S>(stream: &mut S) -> io::Result<()>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    build_reply(stream, Socks5ReplyCode::ConnectionNotAllowed, None).await
}
