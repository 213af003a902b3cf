//! SOCKS5 authentication module
//!
//! Authentication methods are plugins behind the [`AuthMethod`] trait. The
//! [`AuthRegistry`] holds them in registration order, which is also the
//! priority used when the client offers several of them.

mod none;
mod password;

pub use none::NoAuth;
pub use password::{CredentialValidator, PasswordAuth, PasswordRequest, StaticCredentials};

use super::consts::*;
use crate::config::ServerConfig;
use crate::error::{RegistryError, Socks5Error};
use crate::transport::StreamDyn;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Username and password captured by an authentication method
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create a new credential pair
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A pluggable SOCKS5 authentication method
///
/// `negotiate` runs after the server has written `05 <method_id>` and may
/// perform any number of request/response exchanges on the raw client
/// stream. It returns the captured credentials (if the method has any) on
/// success. Any error closes the connection without a SOCKS reply.
#[async_trait]
pub trait AuthMethod: Send + Sync + fmt::Debug {
    /// One-byte method identifier advertised in the method selection reply
    fn method_id(&self) -> u8;

    /// Human-readable method name for logs
    fn name(&self) -> &str;

    /// Run the method's sub-negotiation
    async fn negotiate(
        &self,
        stream: &mut dyn StreamDyn,
    ) -> Result<Option<Credentials>, Socks5Error>;
}

/// Ordered set of authentication methods
#[derive(Debug, Clone, Default)]
pub struct AuthRegistry {
    methods: Vec<Arc<dyn AuthMethod>>,
}

impl AuthRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry described by the server configuration
    ///
    /// Registers [`PasswordAuth`] backed by the configured users when
    /// authentication is required, [`NoAuth`] otherwise.
    pub fn from_config(config: &ServerConfig) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        if config.require_authentication {
            let validator = StaticCredentials::new(config.users.clone());
            registry.register(PasswordAuth::new(validator))?;
        } else {
            registry.register(NoAuth)?;
        }
        Ok(registry)
    }

    /// Register a method with the lowest priority so far
    pub fn register<M: AuthMethod + 'static>(&mut self, method: M) -> Result<(), RegistryError> {
        self.register_arc(Arc::new(method))
    }

    /// Register a shared method with the lowest priority so far
    pub fn register_arc(&mut self, method: Arc<dyn AuthMethod>) -> Result<(), RegistryError> {
        let id = method.method_id();

        if self.methods.len() >= MAX_AUTH_METHODS {
            return Err(RegistryError::Full(self.methods.len()));
        }
        if id == SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE {
            return Err(RegistryError::ReservedMethod(id));
        }
        if self.methods.iter().any(|m| m.method_id() == id) {
            return Err(RegistryError::Duplicate(id));
        }

        tracing::debug!("Registered authentication method {} (0x{:02X})", method.name(), id);
        self.methods.push(method);
        Ok(())
    }

    /// Pick the first registered method that the client offered.
    ///
    /// The client's own ordering of `offered` is irrelevant.
    pub fn select(&self, offered: &[u8]) -> Option<&Arc<dyn AuthMethod>> {
        self.methods
            .iter()
            .find(|method| offered.contains(&method.method_id()))
    }

    /// Registered method identifiers in priority order
    pub fn method_ids(&self) -> Vec<u8> {
        self.methods.iter().map(|m| m.method_id()).collect()
    }

    /// Number of registered methods
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether no method is registered
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}
