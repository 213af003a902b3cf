//! SOCKS5 server
//!
//! [`Server`] holds the configuration, the authentication registry, the
//! policy hook and the bandwidth ledger. [`Server::bind`] opens the listener
//! and [`Listening::run`] accepts clients until shutdown, serving each one on
//! its own task.

use crate::config::{PolicyConfig, ServerConfig};
use crate::connection::{Connection, ConnectionId};
use crate::events::{EventBus, EventReceiver, ServerEvent};
use crate::ledger::BandwidthLedger;
use crate::policy::{evaluate, AllowAll, PolicyDecision, PolicyHook, RulesPolicy, UpstreamProxy};
use crate::socks::auth::AuthRegistry;
use crate::socks::{negotiate, PendingRequest};
use crate::transport::{self, SocketOpts};
use crate::upstream::dial_via_proxy;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

/// Pause after a failed accept before trying again
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection task
struct Shared {
    registry: AuthRegistry,
    policy: Arc<dyn PolicyHook>,
    ledger: Arc<BandwidthLedger>,
    opts: SocketOpts,
    connect_timeout: Option<Duration>,
}

/// A configured, not yet bound SOCKS5 server
pub struct Server {
    config: ServerConfig,
    registry: AuthRegistry,
    policy: Arc<dyn PolicyHook>,
    events: EventBus,
    ledger: Arc<BandwidthLedger>,
}

impl Server {
    /// Create a server from configuration.
    ///
    /// The authentication registry and policy are derived from the config
    /// and can be replaced with [`with_auth_registry`](Self::with_auth_registry)
    /// and [`with_policy`](Self::with_policy).
    pub fn new(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        let registry = AuthRegistry::from_config(&config)
            .with_context(|| "Failed to build authentication registry")?;
        let policy: Arc<dyn PolicyHook> = if config.policy == PolicyConfig::default() {
            Arc::new(AllowAll)
        } else {
            Arc::new(RulesPolicy::from_config(&config.policy))
        };

        let events = EventBus::new();
        let ledger = Arc::new(BandwidthLedger::new(events.clone()));

        Ok(Server {
            config,
            registry,
            policy,
            events,
            ledger,
        })
    }

    /// Replace the policy hook
    pub fn with_policy<P: PolicyHook + 'static>(mut self, policy: P) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Replace the authentication registry
    pub fn with_auth_registry(mut self, registry: AuthRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Subscribe to server events. Nothing emitted while the receiver lives is dropped.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// The server's bandwidth ledger
    pub fn ledger(&self) -> Arc<BandwidthLedger> {
        self.ledger.clone()
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener. Emits [`ServerEvent::Listening`].
    pub async fn bind(self) -> Result<Listening> {
        let bind_addr = self.config.bind_addr();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("Failed to bind {}", bind_addr))?;
        let local_addr = listener.local_addr()?;

        info!("SOCKS5 server listening on {}", local_addr);
        self.events.emit(ServerEvent::Listening(local_addr));

        let limit = self
            .config
            .max_connections
            .map(|max| Arc::new(Semaphore::new(max)));

        let shared = Arc::new(Shared {
            registry: self.registry,
            policy: self.policy,
            ledger: self.ledger,
            opts: SocketOpts::from_tcp_config(&self.config.tcp),
            connect_timeout: self.config.connect_timeout(),
        });

        Ok(Listening {
            listener,
            local_addr,
            limit,
            events: self.events,
            shared,
        })
    }
}

/// A bound server
pub struct Listening {
    listener: TcpListener,
    local_addr: SocketAddr,
    limit: Option<Arc<Semaphore>>,
    events: EventBus,
    shared: Arc<Shared>,
}

impl Listening {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Subscribe to server events. Nothing emitted while the receiver lives is dropped.
    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    /// The server's bandwidth ledger
    pub fn ledger(&self) -> Arc<BandwidthLedger> {
        self.shared.ledger.clone()
    }

    /// Accept connections until `shutdown` fires.
    ///
    /// Only the listener stops; connections already accepted run to completion.
    pub async fn run(self, mut shutdown: broadcast::Receiver<bool>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => self.dispatch(stream, peer),
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        self.events.emit(ServerEvent::TransportError(e.to_string()));
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, closing listener on {}", self.local_addr);
                    break;
                }
            }
        }

        Ok(())
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) {
        let permit = match &self.limit {
            Some(limit) => match limit.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!("Connection limit reached, resetting {}", peer);
                    transport::reset(stream);
                    return;
                }
            },
            None => None,
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = serve(shared, stream, peer).await {
                debug!("Connection from {} ended: {:#}", peer, e);
            }
        });
    }
}

async fn serve(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
    let id = ConnectionId::next();
    let entry = shared.ledger.open(id.clone());
    debug!("Connection {}: accepted from {}", id, peer);

    if let Err(e) = shared.opts.apply(&stream) {
        debug!("Connection {}: failed to apply socket options: {}", id, e);
    }

    let conn = Connection::new(id, peer);
    let pending = negotiate(stream, conn, entry, &shared.registry)
        .await
        .with_context(|| "SOCKS5 handshake failed")?;

    let ctx = pending.policy_context();
    match evaluate(shared.policy.as_ref(), &ctx).await {
        PolicyDecision::Deny => {
            info!(
                "Connection {}: denied {}:{}",
                ctx.connection_id, ctx.destination_host, ctx.destination_port
            );
            pending.deny().await?;
        }
        PolicyDecision::Allow { upstream: None } => {
            pending
                .accept_relay(&shared.opts, shared.connect_timeout)
                .await?;
        }
        PolicyDecision::Allow {
            upstream: Some(proxy),
        } => {
            relay_via_upstream(pending, &proxy, &shared).await?;
        }
    }

    Ok(())
}

async fn relay_via_upstream(
    mut pending: PendingRequest<TcpStream>,
    proxy: &UpstreamProxy,
    shared: &Shared,
) -> Result<()> {
    let target = pending.target().clone();
    let id = pending.connection().id.clone();

    let dialed = pending
        .guard(dial_via_proxy(
            proxy,
            &target,
            &shared.opts,
            shared.connect_timeout,
        ))
        .await?;

    let outbound = match dialed {
        Ok(outbound) => outbound,
        Err(e) => {
            warn!("Connection {}: upstream {} failed: {}", id, proxy, e);
            pending.deny().await?;
            return Err(e.into());
        }
    };

    debug!("Connection {}: chained to {} via {}", id, target, proxy);
    let bound = outbound.local_addr().ok();
    let client = pending.accept_intercept(bound).await?;
    client.relay_metered(outbound).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ServerConfig {
            require_authentication: true,
            ..local_config()
        };
        assert!(Server::new(config).is_err());
    }

    #[tokio::test]
    async fn test_bind_emits_listening() {
        let server = Server::new(local_config()).unwrap();
        let mut events = server.subscribe();

        let listening = server.bind().await.unwrap();
        let addr = listening.local_addr();
        assert_ne!(addr.port(), 0);

        match events.recv().await.unwrap() {
            ServerEvent::Listening(bound) => assert_eq!(bound, addr),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let listening = Server::new(local_config()).unwrap().bind().await.unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

        let handle = tokio::spawn(listening.run(shutdown_rx));
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await;
        assert!(result.unwrap().unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_policy_from_config() {
        let config = ServerConfig {
            policy: PolicyConfig {
                blocked_ports: vec![25],
                ..Default::default()
            },
            ..local_config()
        };
        let server = Server::new(config).unwrap();
        let ctx = crate::policy::PolicyContext {
            connection_id: ConnectionId::next(),
            source: "127.0.0.1:1".parse().unwrap(),
            username: None,
            password: None,
            destination_host: "mail.example".to_string(),
            destination_port: 25,
        };
        assert_eq!(
            evaluate(server.policy.as_ref(), &ctx).await,
            PolicyDecision::Deny
        );
    }
}
