//! Lifecycle supervisor
//!
//! Drives the daemon through its phases:
//!
//! ```text
//!   Starting ──▶ Running ──▶ Draining ──▶ Stopped
//! ```
//!
//! Startup order: debug endpoint, link monitor, SOCKS5 bind, transport
//! selection, netstack bridge, watchdog, SOCKS5 serve, control server.
//! OS signals, a cancelled token and the control server's exit converge on
//! one idempotent [`Shutdown`]. The phase turns Draining as soon as it
//! fires. Teardown closes the engine through the watchdog, then the
//! netstack, then the link monitor.

use crate::debug;
use crate::logpolicy::LogPolicy;
use meshd_core::{
    bridge, abort_process, Backend, ConfigError, ControlServer, DaemonConfig, DebugHandle,
    Engine, EngineComposer, LinkMonitor, Netstack, NetstackError, NetstackFactory, NetstackMode,
    ProxyConfig, ProxyError, ProxyListener, RecoveryAction, SelectError, ServerError, ServerOptions,
    SystemDialer, TransportSelector, Watchdog, DEFAULT_STALL_TIMEOUT,
};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Bound on the final log flush
pub const LOG_FLUSH_DEADLINE: Duration = Duration::from_secs(1);

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// Termination request delivered by the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Interrupt,
    Terminate,
}

/// Forward SIGINT and SIGTERM into a channel.
///
/// Must be called inside the runtime.
#[cfg(unix)]
pub fn os_signals() -> std::io::Result<mpsc::Receiver<Signal>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            let sig = tokio::select! {
                _ = interrupt.recv() => Signal::Interrupt,
                _ = terminate.recv() => Signal::Terminate,
            };
            if tx.send(sig).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

#[cfg(not(unix))]
pub fn os_signals() -> std::io::Result<mpsc::Receiver<Signal>> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if tx.send(Signal::Interrupt).await.is_err() {
                break;
            }
        }
    });
    Ok(rx)
}

/// One-shot cancellation shared by every shutdown path
#[derive(Debug, Default)]
pub struct Shutdown {
    token: CancellationToken,
    reason: OnceLock<String>,
}

impl Shutdown {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel everything; only the first call has any effect
    pub fn trigger(&self, reason: &str) -> bool {
        if self.reason.set(reason.to_string()).is_err() {
            return false;
        }
        info!("Shutdown requested: {}", reason);
        self.token.cancel();
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.reason.get().is_some()
    }

    /// Reason given by the winning trigger
    pub fn reason(&self) -> Option<&str> {
        self.reason.get().map(String::as_str)
    }
}

/// Fatal daemon errors
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Transport(#[from] SelectError),

    #[error("netstack: {0}")]
    Netstack(#[from] NetstackError),

    #[error("SOCKS5: {0}")]
    Proxy(#[from] ProxyError),

    #[error("debug endpoint: {0}")]
    Debug(#[source] std::io::Error),

    #[error("control server: {0}")]
    Server(#[from] ServerError),

    #[error("installing signal handlers: {0}")]
    Signals(#[source] std::io::Error),

    #[error("startup task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl DaemonError {
    /// Process exit status for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            DaemonError::Config(_) => 2,
            _ => 1,
        }
    }
}

/// Background tasks aborted when the set is dropped
#[derive(Default)]
struct TaskSet(Vec<JoinHandle<()>>);

impl TaskSet {
    fn spawn<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.0.push(tokio::spawn(future));
    }

    async fn shutdown(mut self) {
        for task in self.0.drain(..) {
            task.abort();
            let _ = task.await;
        }
    }
}

impl Drop for TaskSet {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

/// Engine and optional stack after a successful startup
struct Started {
    engine: Arc<dyn Engine>,
    netstack: Option<Arc<dyn Netstack>>,
}

/// Owns the daemon from startup to exit
pub struct Supervisor<S> {
    config: DaemonConfig,
    backend: Arc<dyn Backend>,
    netstack: Arc<dyn NetstackFactory>,
    server: S,
    shutdown: Arc<Shutdown>,
    phase: Arc<watch::Sender<Phase>>,
    stall_timeout: Duration,
    recovery: RecoveryAction,
    socks_listener: Mutex<Option<std::net::TcpListener>>,
    fatal: Arc<Mutex<Option<DaemonError>>>,
}

impl<S: ControlServer> Supervisor<S> {
    pub fn new(
        config: DaemonConfig,
        backend: Arc<dyn Backend>,
        netstack: Arc<dyn NetstackFactory>,
        server: S,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Starting);
        Self {
            config,
            backend,
            netstack,
            server,
            shutdown: Arc::new(Shutdown::default()),
            phase: Arc::new(phase),
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            recovery: abort_process(),
            socks_listener: Mutex::new(None),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    /// Override the engine watchdog's bound and recovery action
    pub fn with_watchdog(mut self, timeout: Duration, recovery: RecoveryAction) -> Self {
        self.stall_timeout = timeout;
        self.recovery = recovery;
        self
    }

    /// Serve SOCKS5 on an inherited listener instead of binding the
    /// configured address
    pub fn with_socks_listener(self, listener: std::net::TcpListener) -> Self {
        *self.socks_listener.lock() = Some(listener);
        self
    }

    pub fn shutdown_handle(&self) -> Arc<Shutdown> {
        self.shutdown.clone()
    }

    pub fn phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    /// Run until a signal or the control server ends the daemon, then
    /// flush logs.
    pub async fn run(self, log: LogPolicy, signals: mpsc::Receiver<Signal>) -> Result<(), DaemonError> {
        if let Some(dir) = log.file_dir() {
            info!("Writing logs under {}", dir.display());
        }
        let result = self.run_inner(signals).await;
        match &result {
            Ok(()) => info!("meshd stopped"),
            Err(e) => error!("meshd stopped: {}", e),
        }
        // Unblock anything still waiting on the token
        self.shutdown.trigger("stopped");
        self.set_phase(Phase::Stopped);

        if !log.shutdown(LOG_FLUSH_DEADLINE) {
            eprintln!("meshd: log flush timed out after {:?}", LOG_FLUSH_DEADLINE);
        }
        result
    }

    async fn run_inner(&self, mut signals: mpsc::Receiver<Signal>) -> Result<(), DaemonError> {
        let state = self.config.state_location().ok_or(ConfigError::MissingState)?;
        self.set_phase(Phase::Running);
        let token = self.shutdown.token();
        let mut tasks = TaskSet::default();

        let shutdown = self.shutdown.clone();
        tasks.spawn(async move {
            while let Some(sig) = signals.recv().await {
                if !shutdown.trigger(&format!("{sig:?}")) {
                    info!("Ignoring repeated {:?}; already shutting down", sig);
                }
            }
        });

        // The token may also be cancelled by whoever holds a clone of it
        let shutdown = self.shutdown.clone();
        let phase = self.phase.clone();
        let cancelled = token.clone();
        tasks.spawn(async move {
            cancelled.cancelled().await;
            shutdown.trigger("context cancelled");
            phase.send_if_modified(|p| {
                let running = *p == Phase::Running;
                if running {
                    *p = Phase::Draining;
                }
                running
            });
        });

        let debug_handle = match &self.config.debug_addr {
            Some(addr) => {
                let listener = debug::bind(addr).await.map_err(DaemonError::Debug)?;
                let handle = DebugHandle::new();
                tasks.spawn(debug::serve(listener, handle.clone(), token.clone()));
                Some(handle)
            }
            None => None,
        };

        let link_monitor = Arc::new(LinkMonitor::new());
        if let Err(e) = link_monitor.start() {
            warn!("Link monitor not polling: {}", e);
        }

        let started = match self.start(&link_monitor, &mut tasks, debug_handle.as_ref()).await {
            Ok(started) => started,
            Err(e) => {
                link_monitor.close();
                return Err(e);
            }
        };

        let options = ServerOptions {
            socket_path: self.config.socket_path.clone(),
            state,
            debug: debug_handle,
        };
        info!("meshd running");
        let served = self.server.run(token, started.engine.clone(), options).await;
        self.shutdown.trigger("control server returned");

        self.set_phase(Phase::Draining);
        let engine = started.engine;
        if let Err(e) = tokio::task::spawn_blocking(move || engine.close()).await {
            warn!("Closing engine: {}", e);
        }
        if let Some(stack) = started.netstack {
            stack.close();
        }
        link_monitor.close();
        tasks.shutdown().await;

        if let Some(e) = self.fatal.lock().take() {
            return Err(e);
        }
        match served {
            Ok(()) | Err(ServerError::Canceled) => Ok(()),
            Err(e) => Err(DaemonError::Server(e)),
        }
    }

    async fn start(
        &self,
        link_monitor: &Arc<LinkMonitor>,
        tasks: &mut TaskSet,
        debug_handle: Option<&DebugHandle>,
    ) -> Result<Started, DaemonError> {
        let inherited = self.socks_listener.lock().take();
        let proxy = match (inherited, &self.config.socks_addr) {
            (Some(listener), _) => Some(ProxyListener::from_std(listener, ProxyConfig::default())?),
            (None, Some(addr)) => Some(ProxyListener::bind(addr).await?),
            (None, None) => None,
        };

        let selector = TransportSelector::new(EngineComposer::new(
            self.backend.clone(),
            link_monitor.clone(),
            self.config.port,
            self.config.netstack,
        ));
        let transports = self.config.transports.clone();
        let policy = self.config.netstack;
        let factory = self.netstack.clone();

        // Device creation blocks; keep it off the async workers
        let (engine, mode, netstack) = tokio::task::spawn_blocking(move || -> Result<_, DaemonError> {
            let selection = selector.select(&transports)?;
            let mode = policy.mode(selection.is_userspace());
            match bridge(mode, &selection.engine, factory.as_ref()) {
                Ok(stack) => Ok((selection.engine, mode, stack)),
                Err(e) => {
                    selection.engine.close();
                    Err(DaemonError::Netstack(e))
                }
            }
        })
        .await??;

        if mode != NetstackMode::None {
            info!("Netstack mode {:?}", mode);
        }

        let engine: Arc<dyn Engine> = Arc::new(Watchdog::with_recovery(
            engine,
            self.stall_timeout,
            self.recovery.clone(),
        ));

        if let Some(handle) = debug_handle {
            let status_engine = engine.clone();
            handle.register(
                "engine",
                Arc::new(move || match status_engine.status() {
                    Ok(status) => serde_json::to_value(status).unwrap_or_default(),
                    Err(e) => serde_json::json!({ "error": e.to_string() }),
                }),
            );
        }

        if let Some(proxy) = proxy {
            let dialer = match &netstack {
                Some(stack) => stack.dialer(),
                None => Arc::new(SystemDialer),
            };
            let shutdown = self.shutdown.clone();
            let fatal = self.fatal.clone();
            tasks.spawn(async move {
                if let Err(e) = proxy.serve(dialer).await {
                    error!("SOCKS5 server failed: {}", e);
                    fatal.lock().get_or_insert(DaemonError::Proxy(e));
                    shutdown.trigger("SOCKS5 server failed");
                }
            });
        }

        Ok(Started { engine, netstack })
    }
}
