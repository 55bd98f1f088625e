//! Router
//!
//! Applies tunnel addresses and routes to the host. The kernel router
//! drives `ip`; the subnet-only wrapper hands subnet routes to the
//! userspace stack instead of the kernel.

use crate::device::{run_ip, TunDevice};
use crate::monitor::LinkMonitor;
use ipnet::IpNet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Desired router state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterSettings {
    /// Addresses assigned to the tunnel interface
    pub local_addrs: Vec<IpNet>,
    /// Mesh routes
    pub routes: Vec<IpNet>,
    /// Routes to subnets advertised by peers
    pub subnet_routes: Vec<IpNet>,
}

/// Host routing configurator
pub trait Router: Send + fmt::Debug {
    /// Bring the interface up
    fn up(&mut self) -> Result<(), RouterError>;

    /// Reconcile host state with `settings`
    fn set(&mut self, settings: &RouterSettings) -> Result<(), RouterError>;

    /// Undo everything this router applied. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), RouterError>;

    /// Whether subnet routes are left to a userspace stack
    fn is_subnet_only(&self) -> bool {
        false
    }
}

/// Router errors
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("router for {dev}: {reason}")]
    Command { dev: String, reason: String },

    #[error("router closed")]
    Closed,

    #[error("kernel routing is not supported on {0}")]
    Unsupported(&'static str),
}

/// Router that programs the kernel through `ip`
pub struct KernelRouter {
    dev: String,
    link_monitor: Arc<LinkMonitor>,
    applied: RouterSettings,
    closed: bool,
}

impl KernelRouter {
    pub fn new(dev: &dyn TunDevice, link_monitor: Arc<LinkMonitor>) -> Result<Self, RouterError> {
        if !cfg!(target_os = "linux") {
            return Err(RouterError::Unsupported(std::env::consts::OS));
        }
        debug!("Router bound to {}", dev.name());
        Ok(Self {
            dev: dev.name().to_string(),
            link_monitor,
            applied: RouterSettings::default(),
            closed: false,
        })
    }

    fn ip(&self, args: &[&str]) -> Result<(), RouterError> {
        run_ip(args).map_err(|e| RouterError::Command {
            dev: self.dev.clone(),
            reason: e.to_string(),
        })
    }

    fn sync_list(&self, kind: &str, old: &[IpNet], new: &[IpNet]) -> Result<(), RouterError> {
        let dev = self.dev.as_str();
        for p in old.iter().filter(|p| !new.contains(p)) {
            self.ip(&[kind, "del", p.to_string().as_str(), "dev", dev])?;
        }
        for p in new.iter().filter(|p| !old.contains(p)) {
            self.ip(&[kind, "add", p.to_string().as_str(), "dev", dev])?;
        }
        Ok(())
    }

    /// Remove routing state left behind by a crashed daemon
    pub fn cleanup(dev: &str) {
        if !cfg!(target_os = "linux") {
            return;
        }
        if let Err(e) = run_ip(&["route", "flush", "dev", dev]) {
            debug!("Flushing routes on {}: {}", dev, e);
        }
        crate::device::cleanup(dev);
    }
}

impl Router for KernelRouter {
    fn up(&mut self) -> Result<(), RouterError> {
        if self.closed {
            return Err(RouterError::Closed);
        }
        self.ip(&["link", "set", "dev", self.dev.as_str(), "up"])?;
        info!("Interface {} up", self.dev);
        Ok(())
    }

    fn set(&mut self, settings: &RouterSettings) -> Result<(), RouterError> {
        if self.closed {
            return Err(RouterError::Closed);
        }
        self.sync_list("addr", &self.applied.local_addrs, &settings.local_addrs)?;
        let old_routes: Vec<IpNet> = self
            .applied
            .routes
            .iter()
            .chain(&self.applied.subnet_routes)
            .copied()
            .collect();
        let new_routes: Vec<IpNet> = settings
            .routes
            .iter()
            .chain(&settings.subnet_routes)
            .copied()
            .collect();
        self.sync_list("route", &old_routes, &new_routes)?;
        self.applied = settings.clone();
        debug!(
            "Router {}: {} addrs, {} routes ({} interfaces on host)",
            self.dev,
            settings.local_addrs.len(),
            new_routes.len(),
            self.link_monitor.current().interfaces.len()
        );
        Ok(())
    }

    fn close(&mut self) -> Result<(), RouterError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let applied = std::mem::take(&mut self.applied);
        let mut result = Ok(());
        for p in applied.routes.iter().chain(&applied.subnet_routes) {
            if let Err(e) = self.ip(&["route", "del", p.to_string().as_str(), "dev", self.dev.as_str()]) {
                warn!("{}", e);
            }
        }
        if let Err(e) = self.ip(&["link", "set", "dev", self.dev.as_str(), "down"]) {
            result = Err(e);
        }
        info!("Router for {} closed", self.dev);
        result
    }
}

impl fmt::Debug for KernelRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelRouter")
            .field("dev", &self.dev)
            .field("applied", &self.applied)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Decorator that keeps subnet routes away from the kernel so the
/// userspace stack can serve them.
#[derive(Debug)]
pub struct SubnetRouterWrapper {
    inner: Box<dyn Router>,
}

impl SubnetRouterWrapper {
    pub fn new(inner: Box<dyn Router>) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &dyn Router {
        self.inner.as_ref()
    }
}

impl Router for SubnetRouterWrapper {
    fn up(&mut self) -> Result<(), RouterError> {
        self.inner.up()
    }

    fn set(&mut self, settings: &RouterSettings) -> Result<(), RouterError> {
        let kernel_only = RouterSettings {
            subnet_routes: Vec::new(),
            ..settings.clone()
        };
        self.inner.set(&kernel_only)
    }

    fn close(&mut self) -> Result<(), RouterError> {
        self.inner.close()
    }

    fn is_subnet_only(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[derive(Debug, Default)]
    struct Recorder {
        sets: Arc<Mutex<Vec<RouterSettings>>>,
    }

    impl Router for Recorder {
        fn up(&mut self) -> Result<(), RouterError> {
            Ok(())
        }
        fn set(&mut self, settings: &RouterSettings) -> Result<(), RouterError> {
            self.sets.lock().push(settings.clone());
            Ok(())
        }
        fn close(&mut self) -> Result<(), RouterError> {
            Ok(())
        }
    }

    #[test]
    fn test_subnet_wrapper_strips_subnet_routes() {
        let recorder = Recorder::default();
        let sets = recorder.sets.clone();
        let mut router = SubnetRouterWrapper::new(Box::new(recorder));
        assert!(router.is_subnet_only());
        assert!(!router.inner().is_subnet_only());

        let settings = RouterSettings {
            local_addrs: vec![net("100.64.0.1/32")],
            routes: vec![net("100.64.0.0/10")],
            subnet_routes: vec![net("192.168.1.0/24")],
        };
        router.set(&settings).unwrap();

        let seen = sets.lock();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].subnet_routes.is_empty());
        assert_eq!(seen[0].routes, settings.routes);
        assert_eq!(seen[0].local_addrs, settings.local_addrs);
    }

    #[test]
    fn test_prefixes_are_validated() {
        assert_eq!(net("10.0.0.0/8").to_string(), "10.0.0.0/8");
        assert_eq!(net("fd7a:115c:a1e0::/48").prefix_len(), 48);
        assert!("10.0.0.0/99".parse::<IpNet>().is_err());
        assert!("fd7a::/129".parse::<IpNet>().is_err());
    }
}
