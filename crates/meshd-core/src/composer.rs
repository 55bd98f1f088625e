//! Engine Composer
//!
//! Turns one transport candidate into an [`EngineConfig`], acquiring
//! device, router and DNS configurator in that order. A failure at any
//! step drops the partially built config, which releases what was
//! already acquired.

use crate::config::Candidate;
use crate::device::{self, DeviceError, KernelTun, TunDevice};
use crate::dns::{DnsConfigurator, DnsError, ResolvConfManager};
use crate::engine::{Engine, EngineConfig, EngineError, UserspaceEngine};
use crate::monitor::LinkMonitor;
use crate::netstack::NetstackPolicy;
use crate::router::{KernelRouter, Router, RouterError, SubnetRouterWrapper};
use std::sync::Arc;
use tracing::{debug, info};

/// Constructors for the OS resources an engine is built from
pub trait Backend: Send + Sync {
    fn open_tun(
        &self,
        name: &str,
        tap: bool,
        bridge: Option<&str>,
    ) -> Result<Box<dyn TunDevice>, DeviceError>;

    /// Log likely causes of an open failure
    fn diagnose_tun(&self, name: &str);

    fn new_router(
        &self,
        dev: &dyn TunDevice,
        link_monitor: Arc<LinkMonitor>,
    ) -> Result<Box<dyn Router>, RouterError>;

    fn new_dns(&self, dev: &str) -> Result<Box<dyn DnsConfigurator>, DnsError>;

    fn new_engine(&self, config: EngineConfig) -> Result<Arc<dyn Engine>, EngineError>;
}

/// Backend using the host's kernel devices
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl Backend for SystemBackend {
    fn open_tun(
        &self,
        name: &str,
        tap: bool,
        bridge: Option<&str>,
    ) -> Result<Box<dyn TunDevice>, DeviceError> {
        Ok(Box::new(KernelTun::open(name, tap, bridge)?))
    }

    fn diagnose_tun(&self, name: &str) {
        device::diagnose(name);
    }

    fn new_router(
        &self,
        dev: &dyn TunDevice,
        link_monitor: Arc<LinkMonitor>,
    ) -> Result<Box<dyn Router>, RouterError> {
        Ok(Box::new(KernelRouter::new(dev, link_monitor)?))
    }

    fn new_dns(&self, dev: &str) -> Result<Box<dyn DnsConfigurator>, DnsError> {
        Ok(Box::new(ResolvConfManager::new(dev)?))
    }

    fn new_engine(&self, config: EngineConfig) -> Result<Arc<dyn Engine>, EngineError> {
        Ok(Arc::new(UserspaceEngine::new(config)?))
    }
}

/// Errors building an engine configuration
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("tun device: {0}")]
    Device(#[from] DeviceError),

    #[error("router: {0}")]
    Router(#[from] RouterError),

    #[error("dns: {0}")]
    Dns(#[from] DnsError),
}

/// Builds engine configurations from candidates
pub struct EngineComposer {
    backend: Arc<dyn Backend>,
    link_monitor: Arc<LinkMonitor>,
    port: u16,
    policy: NetstackPolicy,
}

impl EngineComposer {
    pub fn new(
        backend: Arc<dyn Backend>,
        link_monitor: Arc<LinkMonitor>,
        port: u16,
        policy: NetstackPolicy,
    ) -> Self {
        Self {
            backend,
            link_monitor,
            port,
            policy,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Build the configuration for one candidate
    pub fn compose(&self, candidate: &Candidate) -> Result<EngineConfig, ComposeError> {
        let mut config = EngineConfig::new(self.port, self.link_monitor.clone());

        match candidate {
            Candidate::Userspace => {
                debug!("{}: no kernel device", candidate);
            }
            Candidate::Tap { name, bridge } => {
                let dev = self.open(name, true, bridge.as_deref())?;
                config.set_device(dev);
                config.set_tap(true);
            }
            Candidate::Tun(name) => {
                let dev = self.open(name, false, None)?;
                let router = self.backend.new_router(dev.as_ref(), self.link_monitor.clone());
                config.set_device(dev);

                let mut router = router?;
                if self.policy.wrap {
                    debug!("{}: wrapping router for subnet netstack", candidate);
                    router = Box::new(SubnetRouterWrapper::new(router));
                }
                config.set_router(router);

                config.set_dns(self.backend.new_dns(name)?);
            }
        }

        info!("{}: engine config ready ({:?})", candidate, config.transport());
        Ok(config)
    }

    fn open(
        &self,
        name: &str,
        tap: bool,
        bridge: Option<&str>,
    ) -> Result<Box<dyn TunDevice>, ComposeError> {
        self.backend.open_tun(name, tap, bridge).map_err(|e| {
            self.backend.diagnose_tun(name);
            ComposeError::Device(e)
        })
    }
}
