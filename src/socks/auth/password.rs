//! Username/password authentication handler
//!
//! Implements RFC 1929 username/password authentication for SOCKS5.

use super::{AuthMethod, Credentials};
use crate::error::Socks5Error;
use crate::socks::codec::{read_frame, Decoded, Frame};
use crate::socks::consts::*;
use crate::transport::StreamDyn;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Decides whether a username/password pair is accepted
pub trait CredentialValidator: Send + Sync {
    /// Return true to accept the credentials
    fn validate(&self, username: &str, password: &str) -> bool;
}

impl<F> CredentialValidator for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn validate(&self, username: &str, password: &str) -> bool {
        self(username, password)
    }
}

/// Fixed table of accepted users
#[derive(Clone, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    /// Create a validator from a username -> password map
    pub fn new(users: HashMap<String, String>) -> Self {
        Self { users }
    }

    /// Add or replace a single user
    pub fn with_user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.users.insert(username.into(), password.into());
        self
    }
}

impl CredentialValidator for StaticCredentials {
    fn validate(&self, username: &str, password: &str) -> bool {
        self.users
            .get(username)
            .is_some_and(|expected| expected == password)
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("users", &self.users.len())
            .finish()
    }
}

/// Username/password sub-negotiation request
///
/// ```text
/// +----+------+----------+------+----------+
/// |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
/// +----+------+----------+------+----------+
/// | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
/// +----+------+----------+------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswordRequest {
    /// Username as sent
    pub username: String,
    /// Password as sent
    pub password: String,
}

impl Frame for PasswordRequest {
    fn decode(buf: &[u8]) -> Result<Decoded<Self>, Socks5Error> {
        if let Some(&version) = buf.first() {
            if version != SOCKS5_AUTH_VERSION {
                return Err(Socks5Error::InvalidAuthRequest(format!(
                    "Invalid auth version: {}",
                    version
                )));
            }
        }
        if buf.len() < 2 {
            return Ok(Decoded::Incomplete(2 - buf.len()));
        }

        let username_end = 2 + buf[1] as usize;
        if buf.len() < username_end + 1 {
            return Ok(Decoded::Incomplete(username_end + 1 - buf.len()));
        }

        let total = username_end + 1 + buf[username_end] as usize;
        if buf.len() < total {
            return Ok(Decoded::Incomplete(total - buf.len()));
        }

        let username = String::from_utf8(buf[2..username_end].to_vec())
            .map_err(|_| Socks5Error::InvalidAuthRequest("Username is not UTF-8".to_string()))?;
        let password = String::from_utf8(buf[username_end + 1..total].to_vec())
            .map_err(|_| Socks5Error::InvalidAuthRequest("Password is not UTF-8".to_string()))?;

        Ok(Decoded::Complete(PasswordRequest { username, password }))
    }
}

/// Username/password authentication (method 0x02)
pub struct PasswordAuth {
    validator: Box<dyn CredentialValidator>,
}

impl PasswordAuth {
    /// Create the method around a credential validator
    pub fn new<V: CredentialValidator + 'static>(validator: V) -> Self {
        Self {
            validator: Box::new(validator),
        }
    }
}

impl fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordAuth").finish_non_exhaustive()
    }
}

#[async_trait]
impl AuthMethod for PasswordAuth {
    fn method_id(&self) -> u8 {
        SOCKS5_AUTH_METHOD_PASSWORD
    }

    fn name(&self) -> &str {
        "password"
    }

    /// Server responds:
    /// ```text
    /// +----+--------+
    /// |VER | STATUS |
    /// +----+--------+
    /// | 1  |   1    |
    /// +----+--------+
    /// ```
    async fn negotiate(
        &self,
        stream: &mut dyn StreamDyn,
    ) -> Result<Option<Credentials>, Socks5Error> {
        let request = match read_frame::<PasswordRequest, _>(&mut *stream).await {
            Ok(request) => request,
            Err(e @ Socks5Error::InvalidAuthRequest(_)) => {
                send_auth_result(stream, SOCKS5_AUTH_STATUS_FAILURE).await?;
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        if request.username.is_empty() || request.password.is_empty() {
            send_auth_result(stream, SOCKS5_AUTH_STATUS_FAILURE).await?;
            return Err(Socks5Error::InvalidAuthRequest(
                "Empty username or password".to_string(),
            ));
        }

        if !self.validator.validate(&request.username, &request.password) {
            send_auth_result(stream, SOCKS5_AUTH_STATUS_FAILURE).await?;
            tracing::debug!("Authentication failed for user: {}", request.username);
            return Err(Socks5Error::AuthFailed);
        }

        send_auth_result(stream, SOCKS5_AUTH_STATUS_SUCCESS).await?;
        tracing::debug!("Authentication successful for user: {}", request.username);

        Ok(Some(Credentials {
            username: request.username,
            password: request.password,
        }))
    }
}

/// Send authentication result to client
async fn send_auth_result<S>(stream: &mut S, status: u8) -> Result<(), Socks5Error>
where
    S: AsyncWrite + Unpin + ?Sized,
{
    stream.write_all(&[SOCKS5_AUTH_VERSION, status]).await?;
    stream.flush().await?;
    Ok(())
}
