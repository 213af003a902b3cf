//! Test utilities for Socksgate
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use socksgate::config::ServerConfig;
use socksgate::events::{ConnectionSummary, EventReceiver, ServerEvent};
use socksgate::server::Server;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};

/// How long a test waits for an event before failing
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// Spawn a TCP echo server and return its address
pub async fn spawn_echo_server() -> SocketAddr {
    let (listener, addr) = create_test_listener().await;
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

/// Spawn a server that accepts connections and never writes.
///
/// Each accepted socket is handed to the returned receiver.
pub async fn spawn_silent_server() -> (SocketAddr, mpsc::UnboundedReceiver<TcpStream>) {
    let (listener, addr) = create_test_listener().await;
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            if tx.send(socket).is_err() {
                break;
            }
        }
    });
    (addr, rx)
}

/// Server config bound to an ephemeral loopback port
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    }
}

/// A running proxy
pub struct TestProxy {
    /// Listener address
    pub addr: SocketAddr,
    /// Send `true` to stop accepting
    pub shutdown: broadcast::Sender<bool>,
}

/// Bind `server` and run it in the background
pub async fn start_proxy(server: Server) -> TestProxy {
    let listening = server.bind().await.unwrap();
    let addr = listening.local_addr();
    let (shutdown, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(listening.run(shutdown_rx));
    TestProxy { addr, shutdown }
}

/// Client greeting offering `methods`
pub fn greeting(methods: &[u8]) -> Vec<u8> {
    let mut data = vec![0x05, methods.len() as u8];
    data.extend_from_slice(methods);
    data
}

/// CONNECT request for an IP destination
pub fn connect_request(addr: SocketAddr) -> Vec<u8> {
    let mut data = vec![0x05, 0x01, 0x00];
    match addr {
        SocketAddr::V4(v4) => {
            data.push(0x01);
            data.extend_from_slice(&v4.ip().octets());
        }
        SocketAddr::V6(v6) => {
            data.push(0x04);
            data.extend_from_slice(&v6.ip().octets());
        }
    }
    data.extend_from_slice(&addr.port().to_be_bytes());
    data
}

/// CONNECT request for a domain destination
pub fn connect_request_domain(host: &str, port: u16) -> Vec<u8> {
    let mut data = vec![0x05, 0x01, 0x00, 0x03, host.len() as u8];
    data.extend_from_slice(host.as_bytes());
    data.extend_from_slice(&port.to_be_bytes());
    data
}

/// RFC 1929 username/password request
pub fn password_request(username: &str, password: &str) -> Vec<u8> {
    let mut data = vec![0x01, username.len() as u8];
    data.extend_from_slice(username.as_bytes());
    data.push(password.len() as u8);
    data.extend_from_slice(password.as_bytes());
    data
}

/// Read a method selection reply
pub async fn read_method(stream: &mut TcpStream) -> [u8; 2] {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

/// Read a request reply, returning the reply code and bound address
pub async fn read_reply(stream: &mut TcpStream) -> (u8, SocketAddr) {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.unwrap();
    assert_eq!(header[0], 0x05);
    assert_eq!(header[2], 0x00);

    let ip = match header[3] {
        0x01 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await.unwrap();
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x04 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await.unwrap();
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => panic!("unexpected address type {}", other),
    };
    let port = stream.read_u16().await.unwrap();
    (header[1], SocketAddr::new(ip, port))
}

/// Open a no-auth CONNECT through `proxy`, asserting success
pub async fn socks_connect(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&greeting(&[0x00])).await.unwrap();
    assert_eq!(read_method(&mut stream).await, [0x05, 0x00]);

    stream.write_all(&connect_request(target)).await.unwrap();
    let (code, _) = read_reply(&mut stream).await;
    assert_eq!(code, 0x00);
    stream
}

/// Read until the peer closes, returning everything received
pub async fn read_all(stream: &mut TcpStream) -> Vec<u8> {
    let mut data = Vec::new();
    tokio::time::timeout(EVENT_TIMEOUT, stream.read_to_end(&mut data))
        .await
        .expect("peer did not close")
        .unwrap();
    data
}

/// Wait for the next `ConnectionClosed` event
pub async fn next_connection_closed(
    events: &mut EventReceiver,
) -> ConnectionSummary {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            if let ServerEvent::ConnectionClosed(summary) = events.recv().await.unwrap() {
                return summary;
            }
        }
    })
    .await
    .expect("no ConnectionClosed event")
}

/// Wait for the next `SocketClosed` event, collecting events seen before it
pub async fn next_socket_closed(events: &mut EventReceiver) -> Vec<ServerEvent> {
    tokio::time::timeout(EVENT_TIMEOUT, async {
        let mut seen = Vec::new();
        loop {
            let event = events.recv().await.unwrap();
            let done = matches!(event, ServerEvent::SocketClosed { .. });
            seen.push(event);
            if done {
                return seen;
            }
        }
    })
    .await
    .expect("no SocketClosed event")
}
