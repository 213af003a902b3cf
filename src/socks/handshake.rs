//! SOCKS5 handshake state machine
//!
//! Drives a client from the greeting through method negotiation and the
//! request, ending in a [`PendingRequest`] that the caller must resolve.

use super::auth::AuthRegistry;
use super::codec::{read_frame, Greeting};
use super::command::{build_reply, ConnectRequest};
use super::consts::*;
use super::request::PendingRequest;
use crate::connection::{Connection, ConnectionState};
use crate::error::Socks5Error;
use crate::ledger::LedgerEntry;
use std::fmt::Debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Run the handshake up to a parsed CONNECT request.
///
/// On error the connection is finished: any reply the error calls for has
/// already been written, and dropping the returned error together with the
/// stream and ledger entry closes the socket.
pub async fn negotiate<S>(
    mut stream: S,
    mut conn: Connection,
    entry: LedgerEntry,
    registry: &AuthRegistry,
) -> Result<PendingRequest<S>, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    let result = run(&mut stream, &mut conn, registry).await;
    match result {
        Ok(request) => {
            debug!(
                "Connection {}: CONNECT {} from {}",
                conn.id, request.target, conn.peer_addr
            );
            conn.destination = Some(request.target.clone());
            Ok(PendingRequest::new(stream, conn, entry, request.target))
        }
        Err(e) => {
            debug!("Connection {}: handshake failed in {}: {}", conn.id, conn.state, e);
            conn.transition(ConnectionState::Closed);
            Err(e)
        }
    }
}

async fn run<S>(
    stream: &mut S,
    conn: &mut Connection,
    registry: &AuthRegistry,
) -> Result<ConnectRequest, Socks5Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + Debug,
{
    // Greeting
    let greeting: Greeting = read_frame(stream).await?;

    let method = match registry.select(&greeting.methods) {
        Some(method) => method.clone(),
        None => {
            stream
                .write_all(&[SOCKS5_VERSION, SOCKS5_AUTH_METHOD_NOT_ACCEPTABLE])
                .await?;
            stream.flush().await?;
            return Err(Socks5Error::NoAcceptableMethod);
        }
    };

    stream.write_all(&[SOCKS5_VERSION, method.method_id()]).await?;
    stream.flush().await?;
    conn.auth_method = Some(method.method_id());
    conn.transition(ConnectionState::AwaitAuthResult);

    // Method sub-negotiation
    debug!("Connection {}: authenticating with {}", conn.id, method.name());
    conn.credentials = method.negotiate(stream).await?;
    conn.transition(ConnectionState::AwaitRequest);

    // Request
    match read_frame::<ConnectRequest, _>(stream).await {
        Ok(request) => Ok(request),
        Err(e) => {
            if let Some(code) = e.reply_code() {
                build_reply(stream, code, None).await?;
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use crate::events::{EventBus, EventReceiver, ServerEvent};
    use crate::ledger::BandwidthLedger;
    use crate::socks::auth::{NoAuth, PasswordAuth, StaticCredentials};
    use crate::socks::TargetAddr;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};

    struct Harness {
        ledger: Arc<BandwidthLedger>,
        events: EventReceiver,
    }

    impl Harness {
        fn new() -> Self {
            let bus = EventBus::new();
            let events = bus.subscribe();
            Self {
                ledger: Arc::new(BandwidthLedger::new(bus)),
                events,
            }
        }

        fn start(&self) -> (Connection, LedgerEntry) {
            let id = ConnectionId::next();
            let peer: SocketAddr = "127.0.0.1:40000".parse().unwrap();
            (Connection::new(id.clone(), peer), self.ledger.open(id))
        }
    }

    fn no_auth() -> AuthRegistry {
        let mut registry = AuthRegistry::new();
        registry.register(NoAuth).unwrap();
        registry
    }

    async fn drive(
        registry: &AuthRegistry,
        harness: &Harness,
        input: &[u8],
    ) -> (Result<PendingRequest<DuplexStream>, Socks5Error>, DuplexStream) {
        let (mut client, server) = duplex(1024);
        client.write_all(input).await.unwrap();
        let (conn, entry) = harness.start();
        let result = negotiate(server, conn, entry, registry).await;
        (result, client)
    }

    #[tokio::test]
    async fn test_negotiate_no_auth_connect() {
        let harness = Harness::new();
        let input = [5, 1, 0, 5, 1, 0, 1, 127, 0, 0, 1, 0x1F, 0x90];
        let (result, mut client) = drive(&no_auth(), &harness, &input).await;

        let pending = result.unwrap();
        assert_eq!(
            pending.target(),
            &TargetAddr::Ip("127.0.0.1:8080".parse().unwrap())
        );
        assert_eq!(pending.connection().state, ConnectionState::AwaitRequest);
        assert_eq!(pending.connection().auth_method, Some(SOCKS5_AUTH_METHOD_NONE));

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 0]);
    }

    #[tokio::test]
    async fn test_negotiate_no_acceptable_method() {
        let harness = Harness::new();
        let (result, mut client) = drive(&no_auth(), &harness, &[5, 2, 1, 2]).await;

        assert!(matches!(result, Err(Socks5Error::NoAcceptableMethod)));
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![5, 0xFF]);
        assert!(harness.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_negotiate_zero_methods() {
        let harness = Harness::new();
        let (result, mut client) = drive(&no_auth(), &harness, &[5, 0]).await;

        assert!(matches!(result, Err(Socks5Error::NoAcceptableMethod)));
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, vec![5, 0xFF]);
    }

    #[tokio::test]
    async fn test_negotiate_bad_version_is_silent() {
        let harness = Harness::new();
        let (result, mut client) = drive(&no_auth(), &harness, &[4, 1, 0]).await;

        assert!(matches!(result, Err(Socks5Error::UnsupportedVersion(4))));
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_negotiate_command_not_supported() {
        let harness = Harness::new();
        let input = [5, 1, 0, 5, 2, 0, 1, 127, 0, 0, 1, 0, 80];
        let (result, mut client) = drive(&no_auth(), &harness, &input).await;

        assert!(matches!(result, Err(Socks5Error::CommandNotSupported(2))));
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(&reply[..2], &[5, 0]);
        assert_eq!(reply[2..4], [5, SOCKS5_REPLY_COMMAND_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_negotiate_address_type_not_supported() {
        let harness = Harness::new();
        let input = [5, 1, 0, 5, 1, 0, 9, 1, 2, 3, 4];
        let (result, mut client) = drive(&no_auth(), &harness, &input).await;

        assert!(matches!(result, Err(Socks5Error::AddressTypeNotSupported(9))));
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[2..4], [5, SOCKS5_REPLY_ADDRESS_TYPE_NOT_SUPPORTED]);
    }

    #[tokio::test]
    async fn test_negotiate_empty_domain_general_failure() {
        let harness = Harness::new();
        let input = [5, 1, 0, 5, 1, 0, 3, 0];
        let (result, mut client) = drive(&no_auth(), &harness, &input).await;

        assert!(matches!(result, Err(Socks5Error::InvalidDomain(_))));
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply[2..4], [5, SOCKS5_REPLY_GENERAL_FAILURE]);
    }

    #[tokio::test]
    async fn test_negotiate_password_captures_credentials() {
        let harness = Harness::new();
        let mut registry = AuthRegistry::new();
        registry
            .register(PasswordAuth::new(
                StaticCredentials::default().with_user("alice", "secret"),
            ))
            .unwrap();

        let mut input = vec![5, 2, 0, 2];
        input.extend_from_slice(&[1, 5]);
        input.extend_from_slice(b"alice");
        input.push(6);
        input.extend_from_slice(b"secret");
        input.extend_from_slice(&[5, 1, 0, 3, 11]);
        input.extend_from_slice(b"example.com");
        input.extend_from_slice(&443u16.to_be_bytes());

        let (result, mut client) = drive(&registry, &harness, &input).await;
        let pending = result.unwrap();
        assert_eq!(pending.connection().username(), Some("alice"));
        assert_eq!(pending.target(), &TargetAddr::domain("example.com", 443));

        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [5, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_ledger_entry() {
        let mut harness = Harness::new();
        let (result, _client) = drive(&no_auth(), &harness, &[5, 1, 2]).await;
        assert!(result.is_err());

        assert!(harness.ledger.is_empty());
        assert!(matches!(
            harness.events.try_recv().unwrap(),
            ServerEvent::SocketClosed { .. }
        ));
        assert!(harness.events.try_recv().is_err());
    }
}
