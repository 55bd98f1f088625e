//! Link Monitor
//!
//! Watches the host's network interfaces and tells subscribers when the
//! set changes. One monitor is created per process by the supervisor and
//! shared by reference with the router and the engine; only the owner
//! closes it.
//!
//! Polling `/sys/class/net` keeps the monitor dependency-free and works
//! inside containers that hide netlink.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How often interfaces are polled
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Snapshot of the host's interfaces
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkState {
    pub interfaces: BTreeSet<String>,
}

impl LinkState {
    /// Read the current interface set
    pub fn scan() -> Self {
        let mut interfaces = BTreeSet::new();
        if let Ok(entries) = std::fs::read_dir("/sys/class/net") {
            for entry in entries.flatten() {
                interfaces.insert(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Self { interfaces }
    }
}

/// Callback invoked with the new state after each change
pub type ChangeCallback = Arc<dyn Fn(&LinkState) + Send + Sync>;

/// Handle returned by [`LinkMonitor::register`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackId(u64);

struct Shared {
    state: Mutex<LinkState>,
    callbacks: Mutex<Vec<(CallbackId, ChangeCallback)>>,
}

impl Shared {
    fn apply(&self, next: LinkState) -> bool {
        {
            let mut state = self.state.lock();
            if *state == next {
                return false;
            }
            info!(
                "Link change: {} -> {} interfaces",
                state.interfaces.len(),
                next.interfaces.len()
            );
            *state = next.clone();
        }
        // Clone out so callbacks may (un)register without deadlocking
        let callbacks: Vec<ChangeCallback> =
            self.callbacks.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for cb in callbacks {
            cb(&next);
        }
        true
    }
}

/// Shared network-interface observer
pub struct LinkMonitor {
    shared: Arc<Shared>,
    next_id: AtomicU64,
    poll_interval: Duration,
    scanner: fn() -> LinkState,
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    closed: AtomicBool,
}

impl LinkMonitor {
    /// Create a monitor with the initial interface snapshot.
    ///
    /// Polling does not begin until [`LinkMonitor::start`].
    pub fn new() -> Self {
        Self::with_scanner(DEFAULT_POLL_INTERVAL, LinkState::scan)
    }

    /// Create a monitor with a custom poll interval and scan function
    pub fn with_scanner(poll_interval: Duration, scanner: fn() -> LinkState) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(scanner()),
                callbacks: Mutex::new(Vec::new()),
            }),
            next_id: AtomicU64::new(1),
            poll_interval,
            scanner,
            stop: Mutex::new(None),
            worker: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Current interface snapshot
    pub fn current(&self) -> LinkState {
        self.shared.state.lock().clone()
    }

    /// Subscribe to link changes
    pub fn register(&self, callback: ChangeCallback) -> CallbackId {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.shared.callbacks.lock().push((id, callback));
        id
    }

    pub fn unregister(&self, id: CallbackId) {
        self.shared.callbacks.lock().retain(|(cid, _)| *cid != id);
    }

    /// Rescan immediately; returns whether anything changed
    pub fn poll_now(&self) -> bool {
        self.shared.apply((self.scanner)())
    }

    /// Start the background polling thread
    pub fn start(&self) -> std::io::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() || self.is_closed() {
            return Ok(());
        }

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let shared = self.shared.clone();
        let interval = self.poll_interval;
        let scanner = self.scanner;

        let handle = thread::Builder::new()
            .name("link-monitor".to_string())
            .spawn(move || {
                debug!("Link monitor started");
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            shared.apply(scanner());
                        }
                        // Stop requested or owner dropped the sender
                        _ => break,
                    }
                }
                debug!("Link monitor stopped");
            })?;

        *self.stop.lock() = Some(stop_tx);
        *worker = Some(handle);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop polling and drop all subscribers. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Dropping the sender wakes the worker
        self.stop.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                warn!("Link monitor thread panicked");
            }
        }
        self.shared.callbacks.lock().clear();
        debug!("Link monitor closed");
    }
}

impl Default for LinkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LinkMonitor {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for LinkMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkMonitor")
            .field("interfaces", &self.current().interfaces.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn empty() -> LinkState {
        LinkState::default()
    }

    #[test]
    fn test_callbacks_fire_on_change_only() {
        let monitor = LinkMonitor::with_scanner(Duration::from_secs(60), empty);
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let id = monitor.register(Arc::new(move |_: &LinkState| {
            h.fetch_add(1, Ordering::SeqCst);
        }));

        // Scan returns the same empty set
        assert!(!monitor.poll_now());
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let mut next = empty();
        next.interfaces.insert("meshd0".into());
        assert!(monitor.shared.apply(next));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        monitor.unregister(id);
        assert!(monitor.poll_now());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let monitor = LinkMonitor::with_scanner(Duration::from_millis(10), empty);
        monitor.start().unwrap();
        monitor.close();
        monitor.close();
        assert!(monitor.is_closed());

        // A closed monitor does not restart
        monitor.start().unwrap();
        assert!(monitor.worker.lock().is_none());
    }
}
