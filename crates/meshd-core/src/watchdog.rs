//! Engine Watchdog
//!
//! Wraps an engine so no operation can hang the daemon. Each call runs on
//! its own thread and the caller waits at most the stall timeout. A call
//! that exceeds it returns [`EngineError::Stalled`] and fires the recovery
//! action once for that call.

use crate::dns::DnsSettings;
use crate::engine::{Engine, EngineError, EngineStatus, Internals, WireConfig};
use crate::monitor::LinkState;
use crate::router::RouterSettings;
use crossbeam_channel::{bounded, RecvTimeoutError};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, warn};

/// Default stall bound for one engine operation
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(45);

/// Invoked with the stalled operation and the bound it exceeded
pub type RecoveryAction = Arc<dyn Fn(&'static str, Duration) + Send + Sync>;

/// Log and abort so the service manager restarts the daemon
pub fn abort_process() -> RecoveryAction {
    Arc::new(|op: &'static str, after: Duration| {
        error!("Engine {} stalled for {:?}; aborting", op, after);
        std::process::abort();
    })
}

/// Stall-detecting engine wrapper
pub struct Watchdog {
    inner: Arc<dyn Engine>,
    timeout: Duration,
    recovery: RecoveryAction,
    stalls: AtomicU64,
}

impl Watchdog {
    /// Wrap with the default timeout and abort-on-stall recovery
    pub fn wrap(inner: Arc<dyn Engine>) -> Self {
        Self::with_recovery(inner, DEFAULT_STALL_TIMEOUT, abort_process())
    }

    pub fn with_recovery(inner: Arc<dyn Engine>, timeout: Duration, recovery: RecoveryAction) -> Self {
        Self {
            inner,
            timeout,
            recovery,
            stalls: AtomicU64::new(0),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Calls that exceeded the bound so far
    pub fn stalls(&self) -> u64 {
        self.stalls.load(Ordering::SeqCst)
    }

    /// Whether the recovery action has run
    pub fn has_fired(&self) -> bool {
        self.stalls() > 0
    }

    fn watch<T, F>(&self, op: &'static str, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Engine) -> T + Send + 'static,
    {
        let (tx, rx) = bounded(1);
        let inner = self.inner.clone();
        thread::Builder::new()
            .name(format!("watchdog-{op}"))
            .spawn(move || {
                let _ = tx.send(f(inner.as_ref()));
            })
            .map_err(|e| EngineError::Other(format!("spawning watchdog thread: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(value) => Ok(value),
            Err(RecvTimeoutError::Timeout) => {
                self.stalls.fetch_add(1, Ordering::SeqCst);
                (self.recovery)(op, self.timeout);
                Err(EngineError::Stalled {
                    op,
                    secs: self.timeout.as_secs(),
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Panicked(op)),
        }
    }
}

impl Engine for Watchdog {
    fn status(&self) -> Result<EngineStatus, EngineError> {
        self.watch("status", |e| e.status())?
    }

    fn reconfig(&self, config: &WireConfig) -> Result<(), EngineError> {
        let config = config.clone();
        self.watch("reconfig", move |e| e.reconfig(&config))?
    }

    fn set_router(&self, settings: &RouterSettings) -> Result<(), EngineError> {
        let settings = settings.clone();
        self.watch("set_router", move |e| e.set_router(&settings))?
    }

    fn set_dns(&self, settings: &DnsSettings) -> Result<(), EngineError> {
        let settings = settings.clone();
        self.watch("set_dns", move |e| e.set_dns(&settings))?
    }

    fn link_change(&self, state: &LinkState) {
        let state = state.clone();
        if let Err(e) = self.watch("link_change", move |e| e.link_change(&state)) {
            warn!("{}", e);
        }
    }

    fn close(&self) {
        if let Err(e) = self.watch("close", |e| e.close()) {
            warn!("{}", e);
        }
    }

    /// Blocks for the engine's lifetime, so it is not bounded
    fn wait(&self) {
        self.inner.wait();
    }

    fn internals(&self) -> Option<Internals> {
        self.inner.internals()
    }
}

impl fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watchdog")
            .field("timeout", &self.timeout)
            .field("stalls", &self.stalls())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TransportKind;
    use std::sync::atomic::AtomicUsize;

    struct Slow {
        delay: Duration,
        closes: AtomicUsize,
    }

    impl Engine for Slow {
        fn status(&self) -> Result<EngineStatus, EngineError> {
            thread::sleep(self.delay);
            Ok(EngineStatus {
                transport: TransportKind::Userspace,
                tun_name: None,
                listen_port: 41641,
                peers: 2,
                link_changes: 0,
                closed: false,
            })
        }
        fn reconfig(&self, _: &WireConfig) -> Result<(), EngineError> {
            thread::sleep(self.delay);
            Err(EngineError::Other("rejected".into()))
        }
        fn set_router(&self, _: &RouterSettings) -> Result<(), EngineError> {
            Ok(())
        }
        fn set_dns(&self, _: &DnsSettings) -> Result<(), EngineError> {
            Ok(())
        }
        fn link_change(&self, _: &LinkState) {}
        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
        fn wait(&self) {}
    }

    fn counting_recovery() -> (RecoveryAction, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        (
            Arc::new(move |_: &'static str, _: Duration| {
                f.fetch_add(1, Ordering::SeqCst);
            }),
            fired,
        )
    }

    #[test]
    fn test_forwards_results_unchanged() {
        let inner = Arc::new(Slow { delay: Duration::ZERO, closes: AtomicUsize::new(0) });
        let (recovery, fired) = counting_recovery();
        let dog = Watchdog::with_recovery(inner.clone(), Duration::from_secs(5), recovery);

        let status = dog.status().unwrap();
        assert_eq!(status.listen_port, 41641);
        assert_eq!(status.peers, 2);
        assert!(matches!(dog.reconfig(&WireConfig::default()), Err(EngineError::Other(m)) if m == "rejected"));

        dog.close();
        assert_eq!(inner.closes.load(Ordering::SeqCst), 1);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!dog.has_fired());
    }

    #[test]
    fn test_every_stalled_call_fires_recovery() {
        let inner = Arc::new(Slow { delay: Duration::from_millis(500), closes: AtomicUsize::new(0) });
        let (recovery, fired) = counting_recovery();
        let dog = Watchdog::with_recovery(inner, Duration::from_millis(50), recovery);

        assert!(matches!(dog.status(), Err(EngineError::Stalled { op: "status", .. })));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(dog.reconfig(&WireConfig::default()), Err(EngineError::Stalled { .. })));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(dog.stalls(), 2);
        assert!(dog.has_fired());
    }

    #[test]
    fn test_default_timeout() {
        let inner = Arc::new(Slow { delay: Duration::ZERO, closes: AtomicUsize::new(0) });
        assert_eq!(Watchdog::wrap(inner).timeout(), DEFAULT_STALL_TIMEOUT);
    }
}
