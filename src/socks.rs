use std::borrow::Cow;
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::connection::ConnectionGuard;
use crate::forward::dial;
use crate::pipe::{Inspector, Pipe};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_NOT_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const REP_SUCCESS: u8 = 0x00;
/// Sent for any rejected command or address type
const REP_NOT_SUPPORTED: u8 = 0x08;

/// Error type for SOCKS5 negotiation
#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    #[error("unsupported SOCKS version {0}, only SOCKS5 is supported")]
    UnsupportedVersion(u8),

    #[error("no acceptable authentication method in {0:?}, only \"no authentication\" is supported")]
    NoAcceptableMethod(Vec<u8>),

    #[error("unsupported request (version {version}, command {command}), only CONNECT is supported")]
    UnsupportedCommand { version: u8, command: u8 },

    #[error("unsupported address type {0}")]
    UnsupportedAddressType(u8),

    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: TargetAddr,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Socks5Error {
    /// Client went away before finishing the handshake
    pub fn is_early_eof(&self) -> bool {
        matches!(self, Socks5Error::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}

/// Result type for SOCKS5 operations
pub type Socks5Result<T> = Result<T, Socks5Error>;

/// Destination requested by a CONNECT command.
///
/// Domain names keep their raw bytes so the success reply echoes exactly
/// what the client sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4(Ipv4Addr, u16),
    Domain(Vec<u8>, u16),
}

impl TargetAddr {
    pub fn host(&self) -> Cow<'_, str> {
        match self {
            TargetAddr::Ipv4(ip, _) => Cow::Owned(ip.to_string()),
            TargetAddr::Domain(name, _) => String::from_utf8_lossy(name),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ipv4(_, port) | TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Success reply echoing the requested address and port
    pub fn success_reply(&self) -> Vec<u8> {
        let mut reply = vec![SOCKS5_VERSION, REP_SUCCESS, 0x00];
        match self {
            TargetAddr::Ipv4(ip, port) => {
                reply.push(ATYP_IPV4);
                reply.extend_from_slice(&ip.octets());
                reply.extend_from_slice(&port.to_be_bytes());
            }
            TargetAddr::Domain(name, port) => {
                reply.push(ATYP_DOMAIN);
                reply.push(name.len() as u8);
                reply.extend_from_slice(name);
                reply.extend_from_slice(&port.to_be_bytes());
            }
        }
        reply
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host(), self.port())
    }
}

/// Run method negotiation and read the CONNECT request.
///
/// Replies the protocol defines for rejections are written before the
/// error is returned; a wrong greeting version gets no reply at all.
pub async fn negotiate<S>(stream: &mut S) -> Socks5Result<TargetAddr>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Phase 1: greeting and authentication method
    let mut greeting = [0u8; 2];
    stream.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(greeting[0]));
    }

    let mut methods = vec![0u8; greeting[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&AUTH_NONE) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NOT_ACCEPTABLE]).await?;
        return Err(Socks5Error::NoAcceptableMethod(methods));
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NONE]).await?;

    // Phase 2: request header
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;
    if version != SOCKS5_VERSION || command != CMD_CONNECT {
        stream.write_all(&[SOCKS5_VERSION, REP_NOT_SUPPORTED]).await?;
        return Err(Socks5Error::UnsupportedCommand { version, command });
    }

    // Phase 3: destination address, each field read on its own
    match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            let port = stream.read_u16().await?;
            Ok(TargetAddr::Ipv4(Ipv4Addr::from(octets), port))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            stream.read_exact(&mut name).await?;
            let port = stream.read_u16().await?;
            Ok(TargetAddr::Domain(name, port))
        }
        other => {
            stream.write_all(&[SOCKS5_VERSION, REP_NOT_SUPPORTED]).await?;
            Err(Socks5Error::UnsupportedAddressType(other))
        }
    }
}

/// SOCKS5 front end: negotiates, dials the requested destination and relays
#[derive(Debug, Clone)]
pub struct Socks5Handler {
    inspector: Option<Inspector>,
}

impl Socks5Handler {
    pub fn new(inspector: Option<Inspector>) -> Self {
        Self { inspector }
    }

    /// Handle a single SOCKS5 client connection end-to-end
    pub async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) -> Socks5Result<()> {
        let guard = ConnectionGuard::new();

        let target = negotiate(&mut stream).await?;
        trace!(conn = guard.id(), %peer, %target, "socks5 CONNECT");

        // a failed dial closes the client without a reply
        let far = dial(&target.host(), target.port())
            .await
            .map_err(|source| Socks5Error::Dial {
                target: target.clone(),
                source,
            })?;

        stream.write_all(&target.success_reply()).await?;
        debug!(conn = guard.id(), %peer, %target, "socks5 tunnel established");

        Pipe::new(stream, far)
            .inspect(self.inspector.clone())
            .conn_id(guard.id())
            .run()
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curl::CommandSink;
    use crate::pipe::tests::CollectingSink;
    use crate::redirect::RedirectTrace;
    use crate::server::{serve, Service};
    use std::sync::Arc;
    use tokio::io::duplex;
    use tokio::net::TcpListener;
    use tokio_socks::tcp::Socks5Stream;

    async fn spawn_proxy(inspector: Option<Inspector>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let service = Service::Socks5(Socks5Handler::new(inspector));
        tokio::spawn(serve(listener, Arc::new(service)));
        addr
    }

    async fn spawn_echo() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let (mut reader, mut writer) = stream.split();
                    let _ = tokio::io::copy(&mut reader, &mut writer).await;
                });
            }
        });
        addr
    }

    /// Address nothing listens on
    async fn closed_port() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        let _ = stream.read_to_end(&mut buf).await;
        buf
    }

    #[tokio::test]
    async fn test_rejects_missing_no_auth_method() {
        let proxy = spawn_proxy(None).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x02]).await.unwrap();
        assert_eq!(read_to_close(&mut client).await, vec![0x05, 0xFF]);
    }

    #[tokio::test]
    async fn test_rejects_wrong_version_without_reply() {
        let proxy = spawn_proxy(None).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();

        client.write_all(&[0x04, 0x01]).await.unwrap();
        assert!(read_to_close(&mut client).await.is_empty());
    }

    #[tokio::test]
    async fn test_rejects_non_connect_command() {
        let proxy = spawn_proxy(None).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();

        // BIND request header after a successful method negotiation
        client.write_all(&[0x05, 0x02, 0x02, 0x00]).await.unwrap();
        client.write_all(&[0x05, 0x02, 0x00, 0x01]).await.unwrap();
        assert_eq!(read_to_close(&mut client).await, vec![0x05, 0x00, 0x05, 0x08]);
    }

    #[tokio::test]
    async fn test_rejects_ipv6_address_type() {
        let proxy = spawn_proxy(None).await;
        let mut client = TcpStream::connect(proxy).await.unwrap();

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00, 0x04]).await.unwrap();
        assert_eq!(read_to_close(&mut client).await, vec![0x05, 0x00, 0x05, 0x08]);
    }

    #[tokio::test]
    async fn test_connect_ipv4_echoes_target_and_relays() {
        let proxy = spawn_proxy(None).await;
        let echo = spawn_echo().await;
        let mut client = TcpStream::connect(proxy).await.unwrap();

        let [hi, lo] = echo.port().to_be_bytes();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, hi, lo])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, hi, lo]);

        client.write_all(b"ping over socks").await.unwrap();
        let mut echoed = [0u8; 15];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping over socks");
    }

    #[tokio::test]
    async fn test_connect_domain_with_independent_client() {
        let proxy = spawn_proxy(None).await;
        let echo = spawn_echo().await;

        let mut stream = Socks5Stream::connect(proxy, ("localhost", echo.port()))
            .await
            .unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn test_dial_failure_closes_without_reply() {
        let proxy = spawn_proxy(None).await;
        let dead = closed_port().await;
        let mut client = TcpStream::connect(proxy).await.unwrap();

        let [hi, lo] = dead.port().to_be_bytes();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1, hi, lo])
            .await
            .unwrap();
        // only the method selection arrives, no CONNECT reply
        assert_eq!(read_to_close(&mut client).await, vec![0x05, 0x00]);
    }

    #[tokio::test]
    async fn test_negotiate_domain_fields_split_across_writes() {
        let (mut client, mut server) = duplex(64);
        let negotiation = tokio::spawn(async move { negotiate(&mut server).await });

        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00, 0x03, 11]).await.unwrap();
        client.write_all(b"example").await.unwrap();
        client.write_all(b".com").await.unwrap();
        client.write_all(&[0x01]).await.unwrap();
        client.write_all(&[0xBB]).await.unwrap();

        let target = negotiation.await.unwrap().unwrap();
        assert_eq!(target, TargetAddr::Domain(b"example.com".to_vec(), 443));
        assert_eq!(target.to_string(), "example.com:443");

        let mut expected = vec![0x05, 0x00, 0x00, 0x03, 11];
        expected.extend_from_slice(b"example.com");
        expected.extend_from_slice(&[0x01, 0xBB]);
        assert_eq!(target.success_reply(), expected);
    }

    #[test]
    fn test_ipv4_success_reply() {
        let target = TargetAddr::Ipv4(Ipv4Addr::new(93, 184, 216, 34), 80);
        assert_eq!(
            target.success_reply(),
            vec![0x05, 0x00, 0x00, 0x01, 93, 184, 216, 34, 0x00, 0x50]
        );
    }

    /// Minimal origin: `/a` redirects to `/b`, `/b` is served as an attachment
    async fn spawn_download_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let head = read_head(&mut stream).await;
                    let response: &[u8] = if head.starts_with("GET /a ") {
                        b"HTTP/1.1 302 Found\r\nLocation: http://x/b\r\nContent-Length: 0\r\n\r\n"
                    } else {
                        b"HTTP/1.1 200 OK\r\nContent-Disposition: attachment; filename=f\r\nContent-Length: 4\r\n\r\nDATA"
                    };
                    let _ = stream.write_all(response).await;
                });
            }
        });
        addr
    }

    async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read(&mut byte).await.unwrap_or(0) == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8_lossy(&head).into_owned()
    }

    async fn fetch(proxy: SocketAddr, origin: SocketAddr, path: &str) -> String {
        let mut stream = Socks5Stream::connect(proxy, origin).await.unwrap();
        let request = format!("GET {} HTTP/1.1\r\nHost: x\r\nAccept: */*\r\n\r\n", path);
        stream.write_all(request.as_bytes()).await.unwrap();
        read_head(&mut stream).await
    }

    #[tokio::test]
    async fn test_download_after_redirect_emits_original_request() {
        let sink = Arc::new(CollectingSink::default());
        let dyn_sink: Arc<dyn CommandSink> = sink.clone();
        let inspector = Inspector::new(Arc::new(RedirectTrace::new()), dyn_sink);
        let proxy = spawn_proxy(Some(inspector)).await;
        let origin = spawn_download_origin().await;

        let head = fetch(proxy, origin, "/a").await;
        assert!(head.starts_with("HTTP/1.1 302"));
        assert!(sink.commands().is_empty());

        let head = fetch(proxy, origin, "/b").await;
        assert!(head.starts_with("HTTP/1.1 200"));
        assert_eq!(
            sink.commands(),
            vec!["curl 'http://x/a' -H 'Accept: */*' --compressed".to_string()]
        );
    }
}
