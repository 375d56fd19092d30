use std::io;
use std::net::SocketAddr;

use tokio::net::TcpStream;
use tracing::debug;

use crate::connection::ConnectionGuard;
use crate::pipe::{Inspector, Pipe};

/// Resolve `host` (name or literal address) and connect to the first
/// address that accepts
pub async fn dial(host: &str, port: u16) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Plain port forwarder: every accepted connection is relayed to one
/// fixed destination
#[derive(Debug, Clone)]
pub struct Forwarder {
    host: String,
    port: u16,
    inspector: Option<Inspector>,
}

impl Forwarder {
    pub fn new(host: impl Into<String>, port: u16, inspector: Option<Inspector>) -> Self {
        Self {
            host: host.into(),
            port,
            inspector,
        }
    }

    pub fn destination(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> io::Result<()> {
        let guard = ConnectionGuard::new();

        let far = dial(&self.host, self.port).await?;
        debug!(conn = guard.id(), %peer, destination = %self.destination(), "forwarding");

        Pipe::new(stream, far)
            .inspect(self.inspector.clone())
            .conn_id(guard.id())
            .run()
            .await;
        Ok(())
    }
}
