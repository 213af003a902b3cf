//! No authentication handler

use super::{AuthMethod, Credentials};
use crate::error::Socks5Error;
use crate::socks::consts::SOCKS5_AUTH_METHOD_NONE;
use crate::transport::StreamDyn;
use async_trait::async_trait;

/// "No authentication required" (method 0x00)
///
/// Selecting the method is the whole exchange, so `negotiate` reads nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuth;

#[async_trait]
impl AuthMethod for NoAuth {
    fn method_id(&self) -> u8 {
        SOCKS5_AUTH_METHOD_NONE
    }

    fn name(&self) -> &str {
        "none"
    }

    async fn negotiate(
        &self,
        _stream: &mut dyn StreamDyn,
    ) -> Result<Option<Credentials>, Socks5Error> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_no_auth() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(b"rest").await.unwrap();

        let result = NoAuth.negotiate(&mut server).await.unwrap();
        assert!(result.is_none());

        // Nothing was consumed from the stream
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"rest");
    }
}
