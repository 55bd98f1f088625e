//! Network Engine
//!
//! The engine owns the transport for the life of the process: the
//! tunnel device, router and DNS configurator assembled for one
//! transport candidate, plus the UDP socket peers talk to.
//!
//! # Ownership
//!
//! ```text
//!   device ──▶ router ──▶ dns ──▶ EngineConfig ──▶ Engine
//! ```
//!
//! [`EngineConfig`] owns whatever has been acquired so far and releases
//! it in reverse order (dns, router, device) if it is dropped before an
//! engine takes the parts.

use crate::device::{TunDevice, TunHandle};
use crate::dns::{DnsConfigurator, DnsSettings};
use crate::monitor::{CallbackId, LinkMonitor, LinkState};
use crate::router::{Router, RouterSettings};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resources held for one transport candidate
pub struct EngineParts {
    pub listen_port: u16,
    pub link_monitor: Arc<LinkMonitor>,
    pub device: Option<Box<dyn TunDevice>>,
    pub router: Option<Box<dyn Router>>,
    pub dns: Option<Box<dyn DnsConfigurator>>,
    pub is_tap: bool,
}

impl EngineParts {
    fn empty(listen_port: u16, link_monitor: Arc<LinkMonitor>) -> Self {
        Self {
            listen_port,
            link_monitor,
            device: None,
            router: None,
            dns: None,
            is_tap: false,
        }
    }

    /// Close everything still held, newest first
    pub fn release(&mut self) {
        if let Some(mut dns) = self.dns.take() {
            if let Err(e) = dns.close() {
                warn!("Closing DNS configurator: {}", e);
            }
        }
        if let Some(mut router) = self.router.take() {
            if let Err(e) = router.close() {
                warn!("Closing router: {}", e);
            }
        }
        if let Some(mut device) = self.device.take() {
            if let Err(e) = device.close() {
                warn!("Closing device {}: {}", device.name(), e);
            }
        }
    }

    /// Which kind of transport these parts form
    pub fn transport(&self) -> TransportKind {
        match (&self.device, self.is_tap) {
            (None, _) => TransportKind::Userspace,
            (Some(_), true) => TransportKind::Tap,
            (Some(_), false) => TransportKind::Kernel,
        }
    }
}

impl fmt::Debug for EngineParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineParts")
            .field("listen_port", &self.listen_port)
            .field("device", &self.device)
            .field("router", &self.router)
            .field("dns", &self.dns)
            .field("is_tap", &self.is_tap)
            .finish()
    }
}

/// Engine configuration for one transport candidate.
///
/// Built incrementally; dropping it releases whatever it holds.
#[derive(Debug)]
pub struct EngineConfig {
    parts: EngineParts,
}

impl EngineConfig {
    pub fn new(listen_port: u16, link_monitor: Arc<LinkMonitor>) -> Self {
        Self {
            parts: EngineParts::empty(listen_port, link_monitor),
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.parts.listen_port
    }

    pub fn link_monitor(&self) -> &Arc<LinkMonitor> {
        &self.parts.link_monitor
    }

    pub fn set_device(&mut self, device: Box<dyn TunDevice>) {
        self.parts.device = Some(device);
    }

    pub fn set_router(&mut self, router: Box<dyn Router>) {
        self.parts.router = Some(router);
    }

    pub fn set_dns(&mut self, dns: Box<dyn DnsConfigurator>) {
        self.parts.dns = Some(dns);
    }

    pub fn set_tap(&mut self, tap: bool) {
        self.parts.is_tap = tap;
    }

    pub fn device(&self) -> Option<&dyn TunDevice> {
        self.parts.device.as_deref()
    }

    pub fn router(&self) -> Option<&dyn Router> {
        self.parts.router.as_deref()
    }

    pub fn router_mut(&mut self) -> Option<&mut (dyn Router + 'static)> {
        self.parts.router.as_deref_mut()
    }

    pub fn dns(&self) -> Option<&dyn DnsConfigurator> {
        self.parts.dns.as_deref()
    }

    pub fn is_tap(&self) -> bool {
        self.parts.is_tap
    }

    /// No kernel resources; packets are handled in userspace only
    pub fn is_userspace(&self) -> bool {
        self.parts.device.is_none()
    }

    pub fn transport(&self) -> TransportKind {
        self.parts.transport()
    }

    /// Hand ownership of every resource to the caller
    pub fn into_parts(mut self) -> EngineParts {
        let empty = EngineParts::empty(self.parts.listen_port, self.parts.link_monitor.clone());
        std::mem::replace(&mut self.parts, empty)
    }
}

impl Drop for EngineConfig {
    fn drop(&mut self) {
        self.parts.release();
    }
}

/// How the engine reaches the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    Kernel,
    Tap,
    Userspace,
}

/// One peer of the mesh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WirePeer {
    /// Peer public key (base64)
    pub public_key: String,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<(IpAddr, u8)>,
}

/// Peer configuration pushed by the control plane
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireConfig {
    pub peers: Vec<WirePeer>,
}

/// Snapshot of engine state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub transport: TransportKind,
    pub tun_name: Option<String>,
    pub listen_port: u16,
    pub peers: usize,
    pub link_changes: u64,
    pub closed: bool,
}

/// Raw handles exposed to the userspace network stack
#[derive(Debug, Clone)]
pub struct Internals {
    /// Tunnel device, absent for userspace-only transports
    pub tun: Option<TunHandle>,
    /// Socket carrying peer traffic
    pub socket: Arc<UdpSocket>,
}

/// Running network engine
pub trait Engine: Send + Sync {
    fn status(&self) -> Result<EngineStatus, EngineError>;

    /// Replace the peer configuration
    fn reconfig(&self, config: &WireConfig) -> Result<(), EngineError>;

    /// Apply addresses and routes through the router, if any
    fn set_router(&self, settings: &RouterSettings) -> Result<(), EngineError>;

    /// Apply resolver settings through the DNS configurator, if any
    fn set_dns(&self, settings: &DnsSettings) -> Result<(), EngineError>;

    /// Notify the engine that host interfaces changed
    fn link_change(&self, state: &LinkState);

    /// Release every resource. Closing twice is a no-op.
    fn close(&self);

    /// Block until the engine is closed
    fn wait(&self);

    /// Raw handles for bridging; `None` if this engine cannot be bridged
    fn internals(&self) -> Option<Internals> {
        None
    }
}

/// Engine errors
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("binding UDP port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("router: {0}")]
    Router(#[from] crate::router::RouterError),

    #[error("dns: {0}")]
    Dns(#[from] crate::dns::DnsError),

    #[error("engine closed")]
    Closed,

    #[error("watchdog: {op} stalled for {secs}s")]
    Stalled { op: &'static str, secs: u64 },

    #[error("{0} panicked")]
    Panicked(&'static str),

    #[error("{0}")]
    Other(String),
}

/// Engine implementation driving the parts directly from userspace
pub struct UserspaceEngine {
    parts: Mutex<Option<EngineParts>>,
    transport: TransportKind,
    tun: Option<TunHandle>,
    listen_port: u16,
    socket: Arc<UdpSocket>,
    link_monitor: Arc<LinkMonitor>,
    link_callback: CallbackId,
    link_changes: Arc<AtomicU64>,
    wire: Mutex<WireConfig>,
    closed: Mutex<bool>,
    closed_cv: Condvar,
}

impl UserspaceEngine {
    /// Bind the peer socket and take ownership of the config's parts.
    ///
    /// On failure the config is dropped, releasing its resources.
    pub fn new(mut config: EngineConfig) -> Result<Self, EngineError> {
        let port = config.listen_port();
        let socket = UdpSocket::bind(("0.0.0.0", port))
            .map_err(|source| EngineError::Bind { port, source })?;
        let listen_port = socket.local_addr().map(|a| a.port()).unwrap_or(port);

        if let Some(router) = config.router_mut() {
            router.up()?;
        }

        let parts = config.into_parts();
        let transport = parts.transport();
        let tun = parts.device.as_ref().map(|d| d.handle());
        let link_monitor = parts.link_monitor.clone();

        let link_changes = Arc::new(AtomicU64::new(0));
        let counter = link_changes.clone();
        let link_callback = link_monitor.register(Arc::new(move |_: &LinkState| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        info!(
            "Engine started ({:?}, tun {}, UDP port {})",
            transport,
            tun.as_ref().map(|t| t.name.as_str()).unwrap_or("none"),
            listen_port
        );

        Ok(Self {
            parts: Mutex::new(Some(parts)),
            transport,
            tun,
            listen_port,
            socket: Arc::new(socket),
            link_monitor,
            link_callback,
            link_changes,
            wire: Mutex::new(WireConfig::default()),
            closed: Mutex::new(false),
            closed_cv: Condvar::new(),
        })
    }

    fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl Engine for UserspaceEngine {
    fn status(&self) -> Result<EngineStatus, EngineError> {
        Ok(EngineStatus {
            transport: self.transport,
            tun_name: self.tun.as_ref().map(|t| t.name.clone()),
            listen_port: self.listen_port,
            peers: self.wire.lock().peers.len(),
            link_changes: self.link_changes.load(Ordering::Relaxed),
            closed: self.is_closed(),
        })
    }

    fn reconfig(&self, config: &WireConfig) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        debug!("Reconfig: {} peers", config.peers.len());
        *self.wire.lock() = config.clone();
        Ok(())
    }

    fn set_router(&self, settings: &RouterSettings) -> Result<(), EngineError> {
        let mut parts = self.parts.lock();
        let parts = parts.as_mut().ok_or(EngineError::Closed)?;
        if let Some(router) = parts.router.as_mut() {
            router.set(settings)?;
        }
        Ok(())
    }

    fn set_dns(&self, settings: &DnsSettings) -> Result<(), EngineError> {
        let mut parts = self.parts.lock();
        let parts = parts.as_mut().ok_or(EngineError::Closed)?;
        if let Some(dns) = parts.dns.as_mut() {
            dns.set(settings)?;
        }
        Ok(())
    }

    fn link_change(&self, state: &LinkState) {
        self.link_changes.fetch_add(1, Ordering::Relaxed);
        debug!("Engine saw link change ({} interfaces)", state.interfaces.len());
    }

    fn close(&self) {
        let Some(mut parts) = self.parts.lock().take() else {
            return;
        };
        self.link_monitor.unregister(self.link_callback);
        parts.release();
        *self.closed.lock() = true;
        self.closed_cv.notify_all();
        info!("Engine closed");
    }

    fn wait(&self) {
        let mut closed = self.closed.lock();
        while !*closed {
            self.closed_cv.wait(&mut closed);
        }
    }

    fn internals(&self) -> Option<Internals> {
        Some(Internals {
            tun: self.tun.clone(),
            socket: self.socket.clone(),
        })
    }
}

impl Drop for UserspaceEngine {
    fn drop(&mut self) {
        self.close();
    }
}
