//! Error types for Socksgate
//!
//! This module defines the error types shared across the protocol engine,
//! the authentication registry and the server.

use crate::socks::consts::*;
use std::io;
use thiserror::Error;

/// Main error type for Socksgate operations
#[derive(Error, Debug)]
pub enum GateError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SOCKS5 protocol error
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// Authentication registry error
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Outbound dial error
    #[error("Dial error: {0}")]
    Dial(#[from] crate::upstream::DialError),
}

/// SOCKS5 specific errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// IO error on the client stream
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Unsupported SOCKS version
    #[error("Unsupported SOCKS version: {0}")]
    UnsupportedVersion(u8),

    /// No acceptable authentication method
    #[error("No acceptable authentication method")]
    NoAcceptableMethod,

    /// Authentication failed
    #[error("Authentication failed")]
    AuthFailed,

    /// Malformed authentication sub-negotiation
    #[error("Invalid authentication request: {0}")]
    InvalidAuthRequest(String),

    /// Command not supported
    #[error("Command not supported: {0}")]
    CommandNotSupported(u8),

    /// Address type not supported
    #[error("Address type not supported: {0}")]
    AddressTypeNotSupported(u8),

    /// Invalid domain name
    #[error("Invalid domain name: {0}")]
    InvalidDomain(String),

    /// Reply code outside the RFC 1928 table
    #[error("Unknown reply code: {0}")]
    UnknownReplyCode(u8),

    /// The client closed the connection before the request was resolved
    #[error("Client closed the connection")]
    ClientClosed,
}

impl Socks5Error {
    /// Reply code to send before closing, if the error has one.
    ///
    /// Errors without a code close the connection silently.
    pub fn reply_code(&self) -> Option<Socks5ReplyCode> {
        match self {
            Socks5Error::CommandNotSupported(_) => Some(Socks5ReplyCode::CommandNotSupported),
            Socks5Error::AddressTypeNotSupported(_) => {
                Some(Socks5ReplyCode::AddressTypeNotSupported)
            }
            Socks5Error::InvalidDomain(_) => Some(Socks5ReplyCode::GeneralFailure),
            _ => None,
        }
    }
}

/// Errors raised while registering authentication methods
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry already holds the maximum number of methods
    #[error("Authentication registry is full ({0} methods)")]
    Full(usize),

    /// The method identifier is reserved for "no acceptable methods"
    #[error("Method identifier 0x{0:02X} is reserved")]
    ReservedMethod(u8),

    /// A method with the same identifier is already registered
    #[error("Method identifier 0x{0:02X} is already registered")]
    Duplicate(u8),
}

/// Reply codes for SOCKS5 protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Socks5ReplyCode {
    /// Command succeeded
    Succeeded = SOCKS5_REPLY_SUCCEEDED,
    /// General SOCKS server failure
    GeneralFailure = SOCKS5_REPLY_GENERAL_FAILURE,
    /// Connection not allowed by ruleset
    ConnectionNotAllowed = SOCKS5_REPLY_CONNECTION_NOT_ALLOWED,
    /// Network unreachable
    NetworkUnreachable = SOCKS5_REPLY_NETWORK_UNREACHABLE,
    /// Host unreachable
    HostUnreachable = SOCKS5_REPLY_HOST_UNREACHABLE,
    /// Connection refused
    ConnectionRefused = SOCKS5_REPLY_CONNECTION_REFUSED,
    /// TTL expired
    TtlExpired = SOCKS5_REPLY_TTL_EXPIRED,
    /// Command not supported
    CommandNotSupported = SOCKS5_REPLY_COMMAND_NOT_SUPPORTED,
    /// Address type not supported
    AddressTypeNotSupported = SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED,
}

impl From<Socks5ReplyCode> for u8 {
    fn from(code: Socks5ReplyCode) -> Self {
        code as u8
    }
}

impl TryFrom<u8> for Socks5ReplyCode {
    type Error = Socks5Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            SOCKS5_REPLY_SUCCEEDED => Ok(Socks5ReplyCode::Succeeded),
            SOCKS5_REPLY_GENERAL_FAILURE => Ok(Socks5ReplyCode::GeneralFailure),
            SOCKS5_REPLY_CONNECTION_NOT_ALLOWED => Ok(Socks5ReplyCode::ConnectionNotAllowed),
            SOCKS5_REPLY_NETWORK_UNREACHABLE => Ok(Socks5ReplyCode::NetworkUnreachable),
            SOCKS5_REPLY_HOST_UNREACHABLE => Ok(Socks5ReplyCode::HostUnreachable),
            SOCKS5_REPLY_CONNECTION_REFUSED => Ok(Socks5ReplyCode::ConnectionRefused),
            SOCKS5_REPLY_TTL_EXPIRED => Ok(Socks5ReplyCode::TtlExpired),
            SOCKS5_REPLY_COMMAND_NOT_SUPPORTED => Ok(Socks5ReplyCode::CommandNotSupported),
            SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED => {
                Ok(Socks5ReplyCode::AddressTypeNotSupported)
            }
            other => Err(Socks5Error::UnknownReplyCode(other)),
        }
    }
}

impl From<&io::Error> for Socks5ReplyCode {
    fn from(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Socks5ReplyCode::ConnectionRefused,
            io::ErrorKind::TimedOut => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::HostUnreachable => Socks5ReplyCode::HostUnreachable,
            io::ErrorKind::NetworkUnreachable => Socks5ReplyCode::NetworkUnreachable,
            _ => Socks5ReplyCode::GeneralFailure,
        }
    }
}
