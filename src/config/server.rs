//! Server configuration types
//!
//! Defines the configuration structures for the Socksgate server.

use crate::error::GateError;
use crate::policy::UpstreamProxy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Default bind address
fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// Default SOCKS5 port
fn default_port() -> u16 {
    1080
}

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

/// SOCKS5 server configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Diagnostic logging
    #[serde(default)]
    pub verbose: bool,

    /// Register username/password authentication instead of "no authentication"
    #[serde(default)]
    pub require_authentication: bool,

    /// Accepted credentials (username -> password)
    #[serde(default)]
    pub users: HashMap<String, String>,

    /// Ceiling on concurrently open client sockets
    #[serde(default)]
    pub max_connections: Option<usize>,

    /// Timeout in seconds for DNS + dial and for the upstream handshake.
    /// Unset means wait as long as the transport does.
    #[serde(default)]
    pub connect_timeout: Option<u64>,

    /// TCP socket options
    #[serde(default)]
    pub tcp: TcpConfig,

    /// Built-in policy rules
    #[serde(default)]
    pub policy: PolicyConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            verbose: false,
            require_authentication: false,
            users: HashMap::new(),
            max_connections: None,
            connect_timeout: None,
            tcp: TcpConfig::default(),
            policy: PolicyConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Address string the listener binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Connect timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout.map(Duration::from_secs)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), GateError> {
        if self.require_authentication && self.users.is_empty() {
            return Err(GateError::Config(
                "Authentication required but no users configured".to_string(),
            ));
        }
        if self.max_connections == Some(0) {
            return Err(GateError::Config(
                "max_connections must be greater than zero".to_string(),
            ));
        }
        if let Some(upstream) = &self.policy.upstream {
            if upstream.host.is_empty() {
                return Err(GateError::Config("Upstream proxy host is empty".to_string()));
            }
        }
        Ok(())
    }
}

/// Default TCP nodelay setting
fn default_nodelay() -> bool {
    true
}

/// Default keepalive timeout in seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval in seconds
fn default_keepalive_interval() -> u64 {
    8
}

/// TCP socket configuration
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// Keepalive timeout in seconds (0 disables keepalive)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Keepalive probe interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

/// Rules for the built-in policy hook
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct PolicyConfig {
    /// Destination hosts to deny. A leading dot matches the domain and all subdomains.
    #[serde(default)]
    pub blocked_hosts: Vec<String>,

    /// Destination ports to deny
    #[serde(default)]
    pub blocked_ports: Vec<u16>,

    /// Route every allowed connection through this upstream SOCKS5 proxy
    #[serde(default)]
    pub upstream: Option<UpstreamProxy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 1080);
        assert!(!config.verbose);
        assert!(!config.require_authentication);
        assert!(config.max_connections.is_none());
        assert!(config.connect_timeout().is_none());
        assert_eq!(config.bind_addr(), "0.0.0.0:1080");
    }

    #[test]
    fn test_server_config_validate() {
        let config = ServerConfig {
            require_authentication: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut users = HashMap::new();
        users.insert("user".to_string(), "pass".to_string());
        let config = ServerConfig {
            require_authentication: true,
            users,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let config = ServerConfig {
            max_connections: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_upstream_host() {
        let config = ServerConfig {
            policy: PolicyConfig {
                upstream: Some(UpstreamProxy::new("", 1080)),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tcp_config_default() {
        let config = TcpConfig::default();
        assert!(config.nodelay);
        assert_eq!(config.keepalive_secs, 20);
        assert_eq!(config.keepalive_interval, 8);
    }

    #[test]
    fn test_connect_timeout_duration() {
        let config = ServerConfig {
            connect_timeout: Some(5),
            ..Default::default()
        };
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(5)));
    }
}
