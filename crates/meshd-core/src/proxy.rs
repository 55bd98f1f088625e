//! SOCKS5 Proxy Listener
//!
//! Local SOCKS5 proxy whose outbound connections go through the mesh.
//!
//! # Protocol
//!
//! ```text
//! client → SOCKS5 (listen addr) → Dialer (netstack or host) → target
//! ```
//!
//! The listener is bound as soon as the daemon starts so the address is
//! known early, but connections are only served once an engine exists to
//! dial through.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// SOCKS5 version
const SOCKS5_VERSION: u8 = 0x05;

/// SOCKS5 authentication methods
const AUTH_NO_AUTH: u8 = 0x00;
const AUTH_NONE_ACCEPTABLE: u8 = 0xFF;

/// SOCKS5 commands
const CMD_CONNECT: u8 = 0x01;

/// SOCKS5 address types
const ADDR_IPV4: u8 = 0x01;
const ADDR_DOMAIN: u8 = 0x03;
const ADDR_IPV6: u8 = 0x04;

/// SOCKS5 reply codes
const REPLY_SUCCESS: u8 = 0x00;
const REPLY_GENERAL_FAILURE: u8 = 0x01;
const REPLY_HOST_UNREACHABLE: u8 = 0x04;
const REPLY_CONNECTION_REFUSED: u8 = 0x05;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Destination requested by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{addr}"),
            TargetAddr::Domain(host, port) => write!(f, "{host}:{port}"),
        }
    }
}

/// Future returned by [`Dialer::dial`]
pub type DialFuture<'a> = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send + 'a>>;

/// Opens outbound connections on behalf of proxy clients
pub trait Dialer: Send + Sync {
    fn dial<'a>(&'a self, target: &'a TargetAddr) -> DialFuture<'a>;
}

/// Dialer using the host network stack
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDialer;

impl Dialer for SystemDialer {
    fn dial<'a>(&'a self, target: &'a TargetAddr) -> DialFuture<'a> {
        Box::pin(async move {
            match target {
                TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
                TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
            }
        })
    }
}

/// Proxy limits
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Buffer size per direction
    pub buffer_size: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            buffer_size: 16 * 1024,
        }
    }
}

/// Bound SOCKS5 listener, not yet serving
pub struct ProxyListener {
    config: ProxyConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    active_connections: Arc<AtomicU64>,
}

impl ProxyListener {
    /// Bind `addr` (`HOST:PORT` or `:PORT`).
    ///
    /// With port 0 the kernel-assigned address is logged as
    /// `SOCKS5 listening on ADDR`.
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        Self::bind_with(addr, ProxyConfig::default()).await
    }

    pub async fn bind_with(addr: &str, config: ProxyConfig) -> Result<Self, ProxyError> {
        let normalized = match addr.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{port}"),
            None => addr.to_string(),
        };
        let listener = TcpListener::bind(&normalized)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        if normalized.ends_with(":0") {
            info!("SOCKS5 listening on {}", local_addr);
        } else {
            debug!("SOCKS5 bound to {}", local_addr);
        }

        Ok(Self {
            config,
            listener,
            local_addr,
            active_connections: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Adopt an already bound listener, e.g. one inherited from a service
    /// manager. Must be called inside the runtime.
    pub fn from_std(listener: std::net::TcpListener, config: ProxyConfig) -> Result<Self, ProxyError> {
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let local_addr = listener.local_addr()?;
        debug!("SOCKS5 adopted listener on {}", local_addr);
        Ok(Self {
            config,
            listener,
            local_addr,
            active_connections: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared counter of connections being served
    pub fn active_connections(&self) -> Arc<AtomicU64> {
        self.active_connections.clone()
    }

    /// Accept and serve connections until the listener fails.
    ///
    /// Never returns `Ok` on its own; an accept error ends the loop.
    pub async fn serve(self, dialer: Arc<dyn Dialer>) -> Result<(), ProxyError> {
        info!(
            "SOCKS5 proxy serving on {} (max {} connections)",
            self.local_addr, self.config.max_connections
        );
        let semaphore = Arc::new(Semaphore::new(self.config.max_connections));

        loop {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| ProxyError::ShuttingDown)?;

            let (stream, peer) = self.listener.accept().await.map_err(ProxyError::Accept)?;
            let dialer = dialer.clone();
            let active = self.active_connections.clone();
            let buffer_size = self.config.buffer_size;
            active.fetch_add(1, Ordering::Relaxed);

            tokio::spawn(async move {
                debug!("SOCKS5 connection from {}", peer);
                if let Err(e) = handle_connection(stream, dialer.as_ref(), buffer_size).await {
                    debug!("SOCKS5 connection from {}: {}", peer, e);
                }
                active.fetch_sub(1, Ordering::Relaxed);
                drop(permit);
            });
        }
    }
}

impl fmt::Debug for ProxyListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyListener")
            .field("local_addr", &self.local_addr)
            .field("config", &self.config)
            .finish()
    }
}

/// Serve one SOCKS5 client
async fn handle_connection(
    mut stream: TcpStream,
    dialer: &dyn Dialer,
    buffer_size: usize,
) -> Result<(), ProxyError> {
    // Greeting: version + methods
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    if buf[0] != SOCKS5_VERSION {
        return Err(ProxyError::InvalidVersion);
    }

    let mut methods = vec![0u8; buf[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&AUTH_NO_AUTH) {
        stream.write_all(&[SOCKS5_VERSION, AUTH_NONE_ACCEPTABLE]).await?;
        return Err(ProxyError::AuthNotSupported);
    }
    stream.write_all(&[SOCKS5_VERSION, AUTH_NO_AUTH]).await?;

    // Request: version, command, reserved, address type
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(ProxyError::InvalidVersion);
    }
    if header[1] != CMD_CONNECT {
        send_reply(&mut stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(ProxyError::UnsupportedCommand(header[1]));
    }

    let target = match read_target(&mut stream, header[3]).await? {
        Some(target) => target,
        None => {
            send_reply(&mut stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(ProxyError::InvalidAddress(header[3]));
        }
    };
    debug!("SOCKS5 CONNECT to {}", target);

    let remote = match dialer.dial(&target).await {
        Ok(remote) => remote,
        Err(e) => {
            warn!("SOCKS5 dial {}: {}", target, e);
            let code = match e.kind() {
                io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
                io::ErrorKind::NotFound | io::ErrorKind::HostUnreachable => REPLY_HOST_UNREACHABLE,
                _ => REPLY_GENERAL_FAILURE,
            };
            send_reply(&mut stream, code).await?;
            return Err(ProxyError::Dial {
                target: target.to_string(),
                source: e,
            });
        }
    };
    send_reply(&mut stream, REPLY_SUCCESS).await?;
    relay(stream, remote, buffer_size).await
}

async fn read_target(stream: &mut TcpStream, kind: u8) -> Result<Option<TargetAddr>, ProxyError> {
    let target = match kind {
        ADDR_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv4Addr::from(ip).into(), port))
        }
        ADDR_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            let port = stream.read_u16().await?;
            TargetAddr::Ip(SocketAddr::new(Ipv6Addr::from(ip).into(), port))
        }
        ADDR_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut domain = vec![0u8; len as usize];
            stream.read_exact(&mut domain).await?;
            let port = stream.read_u16().await?;
            let domain = String::from_utf8(domain).map_err(|_| ProxyError::InvalidAddress(kind))?;
            TargetAddr::Domain(domain, port)
        }
        _ => return Ok(None),
    };
    Ok(Some(target))
}

async fn send_reply(stream: &mut TcpStream, reply: u8) -> Result<(), ProxyError> {
    let response = [
        SOCKS5_VERSION,
        reply,
        0x00, // reserved
        ADDR_IPV4,
        0, 0, 0, 0, // bind address
        0, 0, // bind port
    ];
    stream.write_all(&response).await?;
    Ok(())
}

/// Copy both directions until each side reaches EOF
async fn relay(mut client: TcpStream, mut remote: TcpStream, buffer_size: usize) -> Result<(), ProxyError> {
    let (mut client_read, mut client_write) = client.split();
    let (mut remote_read, mut remote_write) = remote.split();

    let client_to_remote = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            remote_write.write_all(&buf[..n]).await?;
        }
        remote_write.shutdown().await
    };

    let remote_to_client = async {
        let mut buf = vec![0u8; buffer_size];
        loop {
            let n = remote_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            client_write.write_all(&buf[..n]).await?;
        }
        client_write.shutdown().await
    };

    tokio::try_join!(client_to_remote, remote_to_client)?;
    Ok(())
}

/// Proxy errors
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("binding {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("accepting SOCKS5 connection: {0}")]
    Accept(#[source] io::Error),

    #[error("invalid SOCKS version")]
    InvalidVersion,

    #[error("no supported authentication method")]
    AuthNotSupported,

    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("unsupported address type {0:#04x}")]
    InvalidAddress(u8),

    #[error("dialing {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("shutting down")]
    ShuttingDown,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = conn.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn start_proxy() -> SocketAddr {
        let proxy = ProxyListener::bind("127.0.0.1:0").await.unwrap();
        let addr = proxy.local_addr();
        assert_ne!(addr.port(), 0);
        tokio::spawn(proxy.serve(Arc::new(SystemDialer)));
        addr
    }

    #[tokio::test]
    async fn test_connect_and_relay() {
        let echo = echo_server().await;
        let proxy = start_proxy().await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [SOCKS5_VERSION, AUTH_NO_AUTH]);

        let SocketAddr::V4(v4) = echo else { panic!("expected IPv4") };
        let mut request = vec![SOCKS5_VERSION, CMD_CONNECT, 0, ADDR_IPV4];
        request.extend_from_slice(&v4.ip().octets());
        request.extend_from_slice(&v4.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_SUCCESS);

        client.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn test_rejects_unsupported_command() {
        let proxy = start_proxy().await;

        let mut client = TcpStream::connect(proxy).await.unwrap();
        client.write_all(&[SOCKS5_VERSION, 1, AUTH_NO_AUTH]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        // BIND request
        client
            .write_all(&[SOCKS5_VERSION, 0x02, 0, ADDR_IPV4, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REPLY_COMMAND_NOT_SUPPORTED);
    }

    #[tokio::test]
    async fn test_wildcard_port_binds_concrete_port() {
        let proxy = ProxyListener::bind("127.0.0.1:0").await.unwrap();
        assert_ne!(proxy.local_addr().port(), 0);
        assert_eq!(proxy.active_connections().load(Ordering::Relaxed), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_listener_failure_ends_serve() {
        use std::os::fd::AsRawFd;

        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let shared = std_listener.try_clone().unwrap();
        let proxy = ProxyListener::from_std(std_listener, ProxyConfig::default()).unwrap();
        let serve = tokio::spawn(proxy.serve(Arc::new(SystemDialer)));

        // A listening socket shut down for reading fails every accept
        assert_eq!(unsafe { libc::shutdown(shared.as_raw_fd(), libc::SHUT_RD) }, 0);
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), serve)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(ProxyError::Accept(_))), "{result:?}");
    }

    #[test]
    fn test_target_display() {
        let t = TargetAddr::Domain("peer.mesh".into(), 443);
        assert_eq!(t.to_string(), "peer.mesh:443");
    }
}
