//! SOCKS5 request parser
//!
//! Decodes the client's request that follows a successful authentication.

use crate::error::Socks5Error;
use crate::socks::codec::{Decoded, Frame};
use crate::socks::consts::*;
use crate::socks::types::{SocksCommand, TargetAddr};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Length of `VER CMD RSV ATYP`
const HEADER_LEN: usize = 4;

/// A well-formed CONNECT request
///
/// # SOCKS5 Request Format
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// Any command other than CONNECT fails decoding with
/// [`Socks5Error::CommandNotSupported`] as soon as the header is in, without
/// waiting for the address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Requested destination
    pub target: TargetAddr,
}

impl Frame for ConnectRequest {
    fn decode(buf: &[u8]) -> Result<Decoded<Self>, Socks5Error> {
        if buf.len() < HEADER_LEN {
            return Ok(Decoded::Incomplete(HEADER_LEN - buf.len()));
        }

        let version = buf[0];
        let cmd_byte = buf[1];
        let addr_type = buf[3];

        if version != SOCKS5_VERSION {
            return Err(Socks5Error::UnsupportedVersion(version));
        }

        match SocksCommand::from_byte(cmd_byte) {
            Some(SocksCommand::Connect) => {}
            _ => return Err(Socks5Error::CommandNotSupported(cmd_byte)),
        }

        let body = &buf[HEADER_LEN..];
        let target = match addr_type {
            SOCKS5_ADDR_TYPE_IPV4 => {
                let needed = 4 + 2;
                if body.len() < needed {
                    return Ok(Decoded::Incomplete(needed - body.len()));
                }
                let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                TargetAddr::ipv4(ip, u16::from_be_bytes([body[4], body[5]]))
            }

            SOCKS5_ADDR_TYPE_DOMAIN => {
                let Some(&len) = body.first() else {
                    return Ok(Decoded::Incomplete(1));
                };
                let domain_len = len as usize;
                if domain_len == 0 {
                    return Err(Socks5Error::InvalidDomain("empty domain".to_string()));
                }

                let needed = 1 + domain_len + 2;
                if body.len() < needed {
                    return Ok(Decoded::Incomplete(needed - body.len()));
                }

                let domain = String::from_utf8(body[1..1 + domain_len].to_vec())
                    .map_err(|_| Socks5Error::InvalidDomain("invalid UTF-8".to_string()))?;
                let port = u16::from_be_bytes([body[1 + domain_len], body[2 + domain_len]]);
                TargetAddr::domain(domain, port)
            }

            SOCKS5_ADDR_TYPE_IPV6 => {
                let needed = 16 + 2;
                if body.len() < needed {
                    return Ok(Decoded::Incomplete(needed - body.len()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&body[..16]);
                TargetAddr::ipv6(
                    Ipv6Addr::from(octets),
                    u16::from_be_bytes([body[16], body[17]]),
                )
            }

            other => return Err(Socks5Error::AddressTypeNotSupported(other)),
        };

        Ok(Decoded::Complete(ConnectRequest { target }))
    }
}
