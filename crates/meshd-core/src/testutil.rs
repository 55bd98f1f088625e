//! Fake backend recording every acquisition and release.

use crate::composer::Backend;
use crate::config::USERSPACE_NETWORKING;
use crate::device::{DeviceError, TunDevice, TunHandle};
use crate::dns::{DnsConfigurator, DnsError, DnsSettings};
use crate::engine::{Engine, EngineConfig, EngineError, UserspaceEngine};
use crate::monitor::{LinkMonitor, LinkState};
use crate::router::{Router, RouterError, RouterSettings};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Counters {
    pub devices: AtomicUsize,
    pub routers: AtomicUsize,
    pub dns: AtomicUsize,
    pub engines: AtomicUsize,
    pub diagnosed: AtomicUsize,
    pub closed: AtomicUsize,
}

type Log = Arc<Mutex<Vec<String>>>;

#[derive(Debug)]
struct FakeResource {
    kind: &'static str,
    name: String,
    tap: bool,
    log: Log,
    counters: Arc<Counters>,
    closed: bool,
}

impl FakeResource {
    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.closed.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push(format!("close {} {}", self.kind, self.name));
        }
    }
}

impl TunDevice for FakeResource {
    fn name(&self) -> &str {
        &self.name
    }
    fn is_tap(&self) -> bool {
        self.tap
    }
    fn handle(&self) -> TunHandle {
        TunHandle { name: self.name.clone(), fd: None, tap: self.tap }
    }
    fn close(&mut self) -> Result<(), DeviceError> {
        self.release();
        Ok(())
    }
}

impl Router for FakeResource {
    fn up(&mut self) -> Result<(), RouterError> {
        Ok(())
    }
    fn set(&mut self, _: &RouterSettings) -> Result<(), RouterError> {
        Ok(())
    }
    fn close(&mut self) -> Result<(), RouterError> {
        self.release();
        Ok(())
    }
}

impl DnsConfigurator for FakeResource {
    fn set(&mut self, _: &DnsSettings) -> Result<(), DnsError> {
        Ok(())
    }
    fn close(&mut self) -> Result<(), DnsError> {
        self.release();
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Failures {
    device: HashSet<String>,
    router: HashSet<String>,
    dns: HashSet<String>,
    engine: HashSet<String>,
}

/// Backend whose resources only record what happens to them
pub struct FakeBackend {
    pub counters: Arc<Counters>,
    log: Log,
    failures: Mutex<Failures>,
    link_monitor: Arc<LinkMonitor>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self {
            counters: Arc::default(),
            log: Log::default(),
            failures: Mutex::default(),
            link_monitor: Arc::new(LinkMonitor::with_scanner(
                Duration::from_secs(60),
                LinkState::default,
            )),
        }
    }
}

impl FakeBackend {
    pub fn link_monitor(&self) -> Arc<LinkMonitor> {
        self.link_monitor.clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn fail_device(&self, name: &str) {
        self.failures.lock().device.insert(name.into());
    }

    pub fn fail_router(&self, name: &str) {
        self.failures.lock().router.insert(name.into());
    }

    pub fn fail_dns(&self, name: &str) {
        self.failures.lock().dns.insert(name.into());
    }

    /// Fail engine creation for a device name or `userspace-networking`
    pub fn fail_engine(&self, name: &str) {
        self.failures.lock().engine.insert(name.into());
    }

    fn resource(&self, kind: &'static str, name: &str, tap: bool) -> FakeResource {
        FakeResource {
            kind,
            name: name.to_string(),
            tap,
            log: self.log.clone(),
            counters: self.counters.clone(),
            closed: false,
        }
    }
}

impl Backend for FakeBackend {
    fn open_tun(
        &self,
        name: &str,
        tap: bool,
        bridge: Option<&str>,
    ) -> Result<Box<dyn TunDevice>, DeviceError> {
        if self.failures.lock().device.contains(name) {
            return Err(DeviceError::InvalidName(name.into()));
        }
        self.counters.devices.fetch_add(1, Ordering::SeqCst);
        let mut event = format!("open {name}");
        if tap {
            event.push_str(" tap");
        }
        if let Some(bridge) = bridge {
            event.push_str(&format!(" bridge={bridge}"));
        }
        self.log.lock().push(event);
        Ok(Box::new(self.resource("device", name, tap)))
    }

    fn diagnose_tun(&self, _name: &str) {
        self.counters.diagnosed.fetch_add(1, Ordering::SeqCst);
    }

    fn new_router(
        &self,
        dev: &dyn TunDevice,
        _link_monitor: Arc<LinkMonitor>,
    ) -> Result<Box<dyn Router>, RouterError> {
        if self.failures.lock().router.contains(dev.name()) {
            return Err(RouterError::Command {
                dev: dev.name().into(),
                reason: "injected".into(),
            });
        }
        self.counters.routers.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("router {}", dev.name()));
        Ok(Box::new(self.resource("router", dev.name(), false)))
    }

    fn new_dns(&self, dev: &str) -> Result<Box<dyn DnsConfigurator>, DnsError> {
        if self.failures.lock().dns.contains(dev) {
            return Err(DnsError::Unsupported("test"));
        }
        self.counters.dns.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("dns {dev}"));
        Ok(Box::new(self.resource("dns", dev, false)))
    }

    fn new_engine(&self, config: EngineConfig) -> Result<Arc<dyn Engine>, EngineError> {
        let key = config
            .device()
            .map(|d| d.name().to_string())
            .unwrap_or_else(|| USERSPACE_NETWORKING.to_string());
        if self.failures.lock().engine.contains(&key) {
            return Err(EngineError::Other(format!("injected failure for {key}")));
        }
        self.counters.engines.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("engine {key}"));
        Ok(Arc::new(UserspaceEngine::new(config)?))
    }
}
