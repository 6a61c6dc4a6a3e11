//! Transport module - socket factory for the connection manager.
//!
//! The connection manager opens two sockets per session (command and
//! callback), both produced by the same [`Connector`]. Tests substitute an
//! in-memory connector; production code uses [`TcpConnector`].

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// Boxed future returned by [`Connector::connect`].
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A bidirectional byte stream usable as a proxy channel.
pub trait Connection: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Connection for T {}

/// Type-erased connection handed to the framing layer.
pub type BoxedConnection = Box<dyn Connection>;

/// Factory producing fresh connections to the proxy server.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self) -> BoxFuture<'static, std::io::Result<BoxedConnection>>;
}

/// TCP connector targeting a host/port pair.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> BoxFuture<'static, std::io::Result<BoxedConnection>> {
        let addr = (self.host.clone(), self.port);
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            // Request/response lines are tiny; don't let Nagle delay them.
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedConnection)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_connector_accessors() {
        let c = TcpConnector::new("127.0.0.1", 56487);
        assert_eq!(c.host(), "127.0.0.1");
        assert_eq!(c.port(), 56487);
    }

    #[tokio::test]
    async fn test_tcp_connector_refused() {
        // Port 1 on loopback is assumed closed.
        let c = TcpConnector::new("127.0.0.1", 1);
        assert!(c.connect().await.is_err());
    }
}
