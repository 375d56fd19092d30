use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, info, warn};

use crate::forward::Forwarder;
use crate::socks::Socks5Handler;

const LISTEN_BACKLOG: u32 = 1024;

/// What to do with each accepted connection
#[derive(Debug, Clone)]
pub enum Service {
    /// Negotiate SOCKS5 and relay to the requested destination
    Socks5(Socks5Handler),
    /// Relay to one fixed destination
    Forward(Forwarder),
}

impl Service {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        match self {
            Service::Socks5(handler) => {
                if let Err(e) = handler.handle(stream, peer).await {
                    if e.is_early_eof() {
                        debug!(%peer, "socks5 client left during handshake");
                    } else {
                        warn!(%peer, "socks5: {}", e);
                    }
                }
            }
            Service::Forward(forwarder) => {
                if let Err(e) = forwarder.handle(stream, peer).await {
                    warn!(%peer, "failed to connect to {}: {}", forwarder.destination(), e);
                }
            }
        }
    }
}

/// Bind a listener with `SO_REUSEADDR` set
pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(LISTEN_BACKLOG)
}

/// Accept forever, handling every connection on its own task
pub async fn serve(listener: TcpListener, service: Arc<Service>) {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {}", addr);
    }

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, "set_nodelay failed: {}", e);
                    }
                    service.handle(stream, peer).await;
                });
            }
            Err(e) => {
                warn!("Accept error: {} (continuing)", e);
                continue;
            }
        }
    }
}
