//! Policy gate
//!
//! After authentication and request parsing every connection is put to a
//! [`PolicyHook`] exactly once. The hook may deny, allow a direct relay, or
//! allow through an upstream SOCKS5 proxy.

use crate::config::PolicyConfig;
use crate::connection::ConnectionId;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;

/// Credentials presented to an upstream proxy
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAuth {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl fmt::Debug for ProxyAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Upstream SOCKS5 proxy to chain through
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamProxy {
    /// Proxy host name or address
    pub host: String,
    /// Proxy port
    pub port: u16,
    /// Optional username/password for the proxy
    #[serde(default)]
    pub auth: Option<ProxyAuth>,
}

impl UpstreamProxy {
    /// Upstream without authentication
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth: None,
        }
    }

    /// Use username/password authentication with the upstream
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(ProxyAuth {
            username: username.into(),
            password: password.into(),
        });
        self
    }
}

impl fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Outcome of a policy evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    /// Refuse with "connection not allowed by ruleset"
    Deny,
    /// Relay directly, or through `upstream` when set
    Allow {
        /// Upstream proxy to chain through
        upstream: Option<UpstreamProxy>,
    },
}

impl PolicyDecision {
    /// Allow a direct relay
    pub fn allow() -> Self {
        PolicyDecision::Allow { upstream: None }
    }

    /// Allow through an upstream proxy
    pub fn via(upstream: UpstreamProxy) -> Self {
        PolicyDecision::Allow {
            upstream: Some(upstream),
        }
    }
}

/// What the hook gets to see about a connection
#[derive(Debug, Clone)]
pub struct PolicyContext {
    /// Connection identifier
    pub connection_id: ConnectionId,
    /// Client address
    pub source: SocketAddr,
    /// Authenticated username
    pub username: Option<String>,
    /// Authenticated password
    pub password: Option<String>,
    /// Requested host (domain name or IP literal)
    pub destination_host: String,
    /// Requested port
    pub destination_port: u16,
}

/// Operator-supplied decision function
#[async_trait]
pub trait PolicyHook: Send + Sync {
    /// Decide what to do with a connection request
    async fn decide(&self, ctx: &PolicyContext) -> anyhow::Result<PolicyDecision>;
}

/// Run the hook, turning errors and panics into a deny.
pub async fn evaluate(hook: &dyn PolicyHook, ctx: &PolicyContext) -> PolicyDecision {
    match AssertUnwindSafe(hook.decide(ctx)).catch_unwind().await {
        Ok(Ok(decision)) => {
            tracing::debug!(
                "Connection {}: policy decision for {}:{}: {:?}",
                ctx.connection_id,
                ctx.destination_host,
                ctx.destination_port,
                decision
            );
            decision
        }
        Ok(Err(e)) => {
            tracing::warn!(
                "Connection {}: policy hook failed, denying: {:#}",
                ctx.connection_id,
                e
            );
            PolicyDecision::Deny
        }
        Err(_) => {
            tracing::warn!(
                "Connection {}: policy hook panicked, denying",
                ctx.connection_id
            );
            PolicyDecision::Deny
        }
    }
}

/// Allow every request as a direct relay
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl PolicyHook for AllowAll {
    async fn decide(&self, _ctx: &PolicyContext) -> anyhow::Result<PolicyDecision> {
        Ok(PolicyDecision::allow())
    }
}

/// Adapter for synchronous closures
pub struct FnPolicy<F>(pub F);

#[async_trait]
impl<F> PolicyHook for FnPolicy<F>
where
    F: Fn(&PolicyContext) -> PolicyDecision + Send + Sync,
{
    async fn decide(&self, ctx: &PolicyContext) -> anyhow::Result<PolicyDecision> {
        Ok((self.0)(ctx))
    }
}

/// Static deny rules plus an optional default upstream
#[derive(Debug, Clone, Default)]
pub struct RulesPolicy {
    blocked_hosts: Vec<String>,
    blocked_ports: Vec<u16>,
    upstream: Option<UpstreamProxy>,
}

impl RulesPolicy {
    /// Build from the `[server.policy]` section
    pub fn from_config(config: &PolicyConfig) -> Self {
        Self {
            blocked_hosts: config
                .blocked_hosts
                .iter()
                .map(|host| host.to_ascii_lowercase())
                .collect(),
            blocked_ports: config.blocked_ports.clone(),
            upstream: config.upstream.clone(),
        }
    }

    /// Whether the rules block `host`.
    ///
    /// A rule with a leading dot matches the domain itself and any subdomain.
    pub fn is_host_blocked(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.blocked_hosts.iter().any(|rule| match rule.strip_prefix('.') {
            Some(domain) => host == domain || host.ends_with(rule.as_str()),
            None => host == *rule,
        })
    }
}

#[async_trait]
impl PolicyHook for RulesPolicy {
    async fn decide(&self, ctx: &PolicyContext) -> anyhow::Result<PolicyDecision> {
        if self.blocked_ports.contains(&ctx.destination_port)
            || self.is_host_blocked(&ctx.destination_host)
        {
            return Ok(PolicyDecision::Deny);
        }
        Ok(PolicyDecision::Allow {
            upstream: self.upstream.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(host: &str, port: u16) -> PolicyContext {
        PolicyContext {
            connection_id: ConnectionId::next(),
            source: "127.0.0.1:50000".parse().unwrap(),
            username: None,
            password: None,
            destination_host: host.to_string(),
            destination_port: port,
        }
    }

    struct Failing;

    #[async_trait]
    impl PolicyHook for Failing {
        async fn decide(&self, _ctx: &PolicyContext) -> anyhow::Result<PolicyDecision> {
            anyhow::bail!("backend unavailable")
        }
    }

    struct Panicking;

    #[async_trait]
    impl PolicyHook for Panicking {
        async fn decide(&self, _ctx: &PolicyContext) -> anyhow::Result<PolicyDecision> {
            panic!("hook bug")
        }
    }

    #[tokio::test]
    async fn test_allow_all() {
        let decision = evaluate(&AllowAll, &ctx("example.com", 80)).await;
        assert_eq!(decision, PolicyDecision::allow());
    }

    #[tokio::test]
    async fn test_error_denies() {
        assert_eq!(evaluate(&Failing, &ctx("example.com", 80)).await, PolicyDecision::Deny);
    }

    #[tokio::test]
    async fn test_panic_denies() {
        assert_eq!(evaluate(&Panicking, &ctx("example.com", 80)).await, PolicyDecision::Deny);
    }

    #[tokio::test]
    async fn test_fn_policy() {
        let hook = FnPolicy(|ctx: &PolicyContext| {
            if ctx.username.as_deref() == Some("admin") {
                PolicyDecision::allow()
            } else {
                PolicyDecision::Deny
            }
        });

        assert_eq!(evaluate(&hook, &ctx("example.com", 80)).await, PolicyDecision::Deny);

        let mut admin = ctx("example.com", 80);
        admin.username = Some("admin".to_string());
        assert_eq!(evaluate(&hook, &admin).await, PolicyDecision::allow());
    }

    #[test]
    fn test_rules_host_matching() {
        let rules = RulesPolicy::from_config(&PolicyConfig {
            blocked_hosts: vec![".Internal".to_string(), "evil.com".to_string()],
            ..Default::default()
        });

        assert!(rules.is_host_blocked("internal"));
        assert!(rules.is_host_blocked("db.internal"));
        assert!(rules.is_host_blocked("a.b.INTERNAL."));
        assert!(rules.is_host_blocked("evil.com"));
        assert!(!rules.is_host_blocked("sub.evil.com"));
        assert!(!rules.is_host_blocked("notinternal"));
        assert!(!rules.is_host_blocked("example.com"));
    }

    #[tokio::test]
    async fn test_rules_decisions() {
        let upstream = UpstreamProxy::new("10.0.0.1", 1080).with_auth("u", "p");
        let rules = RulesPolicy::from_config(&PolicyConfig {
            blocked_hosts: vec!["blocked.example".to_string()],
            blocked_ports: vec![25],
            upstream: Some(upstream.clone()),
        });

        assert_eq!(rules.decide(&ctx("mail.example", 25)).await.unwrap(), PolicyDecision::Deny);
        assert_eq!(
            rules.decide(&ctx("blocked.example", 443)).await.unwrap(),
            PolicyDecision::Deny
        );
        assert_eq!(
            rules.decide(&ctx("ok.example", 443)).await.unwrap(),
            PolicyDecision::via(upstream)
        );
    }

    #[test]
    fn test_upstream_display() {
        assert_eq!(UpstreamProxy::new("proxy.local", 1080).to_string(), "proxy.local:1080");
        assert_eq!(UpstreamProxy::new("::1", 1080).to_string(), "[::1]:1080");
    }

    #[test]
    fn test_proxy_auth_debug_redacts_password() {
        let upstream = UpstreamProxy::new("proxy", 1).with_auth("user", "topsecret");
        assert!(!format!("{:?}", upstream).contains("topsecret"));
    }
}
