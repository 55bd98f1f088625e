//! Userspace Network Stack Bridge
//!
//! Decides whether a userspace TCP/IP stack sits on top of the engine and
//! attaches it once the engine is running.
//!
//! ```text
//!   override ─┐
//!   platform ─┼─▶ NetstackPolicy ──(selected transport)──▶ NetstackMode
//!             │
//!   Engine::internals() ──▶ NetstackFactory::create ──▶ Netstack::start
//! ```

use crate::config::Platform;
use crate::engine::{Engine, Internals};
use crate::proxy::{Dialer, SystemDialer};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// How much traffic the userspace stack intercepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetstackMode {
    /// No userspace stack
    None,
    /// All traffic; there is no kernel device
    FullTakeover,
    /// Only subnet routes; the kernel handles the rest
    SubnetOnly,
}

/// Netstack decision inputs, resolved once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetstackPolicy {
    /// Wrap the kernel router so the stack serves subnet routes
    pub wrap: bool,
}

impl NetstackPolicy {
    /// An explicit override beats the platform default
    pub fn resolve(wrap_override: Option<bool>, platform: Platform) -> Self {
        Self {
            wrap: wrap_override.unwrap_or_else(|| platform.wraps_netstack_by_default()),
        }
    }

    /// Final mode once the winning transport is known
    pub fn mode(&self, selected_userspace: bool) -> NetstackMode {
        if selected_userspace {
            NetstackMode::FullTakeover
        } else if self.wrap {
            NetstackMode::SubnetOnly
        } else {
            NetstackMode::None
        }
    }
}

/// Running userspace stack
pub trait Netstack: Send + Sync {
    fn start(&self) -> Result<(), NetstackError>;

    /// Whether only subnet routes are intercepted
    fn only_subnets(&self) -> bool;

    /// Dialer for connections originated by local proxies
    fn dialer(&self) -> Arc<dyn Dialer>;

    /// Stop intercepting. Closing twice is a no-op.
    fn close(&self);
}

/// Builds stacks over an engine's raw handles
pub trait NetstackFactory: Send + Sync {
    fn create(
        &self,
        internals: Internals,
        engine: Arc<dyn Engine>,
        only_subnets: bool,
    ) -> Result<Arc<dyn Netstack>, NetstackError>;
}

/// Netstack errors
#[derive(Debug, thiserror::Error)]
pub enum NetstackError {
    #[error("engine does not expose internals; cannot bridge a userspace stack")]
    Unsupported,

    #[error("creating netstack: {0}")]
    Create(String),

    #[error("starting netstack: {0}")]
    Start(String),
}

/// Attach a userspace stack to a running engine, if `mode` needs one
pub fn bridge(
    mode: NetstackMode,
    engine: &Arc<dyn Engine>,
    factory: &dyn NetstackFactory,
) -> Result<Option<Arc<dyn Netstack>>, NetstackError> {
    let only_subnets = match mode {
        NetstackMode::None => return Ok(None),
        NetstackMode::FullTakeover => false,
        NetstackMode::SubnetOnly => true,
    };
    let internals = engine.internals().ok_or(NetstackError::Unsupported)?;
    let stack = factory.create(internals, engine.clone(), only_subnets)?;
    stack.start()?;
    info!("Netstack started ({:?})", mode);
    Ok(Some(stack))
}

/// Minimal stack: records its mode and dials through the host
pub struct UserspaceStack {
    internals: Internals,
    engine: Arc<dyn Engine>,
    only_subnets: bool,
    started: AtomicBool,
    closed: AtomicBool,
}

impl UserspaceStack {
    pub fn new(internals: Internals, engine: Arc<dyn Engine>, only_subnets: bool) -> Self {
        Self {
            internals,
            engine,
            only_subnets,
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl Netstack for UserspaceStack {
    fn start(&self) -> Result<(), NetstackError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NetstackError::Start("stack closed".into()));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let socket = self
            .internals
            .socket
            .local_addr()
            .map_err(|e| NetstackError::Start(e.to_string()))?;
        let transport = self
            .engine
            .status()
            .map(|s| format!("{:?}", s.transport))
            .unwrap_or_else(|_| "unknown".into());
        debug!(
            "Netstack over {} (tun {}, socket {})",
            transport,
            self.internals.tun.as_ref().map(|t| t.name.as_str()).unwrap_or("none"),
            socket
        );
        Ok(())
    }

    fn only_subnets(&self) -> bool {
        self.only_subnets
    }

    fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::new(SystemDialer)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Netstack closed");
        }
    }
}

impl fmt::Debug for UserspaceStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserspaceStack")
            .field("tun", &self.internals.tun)
            .field("only_subnets", &self.only_subnets)
            .field("started", &self.is_started())
            .finish()
    }
}

/// Factory for [`UserspaceStack`]
#[derive(Debug, Default, Clone, Copy)]
pub struct UserspaceStackFactory;

impl NetstackFactory for UserspaceStackFactory {
    fn create(
        &self,
        internals: Internals,
        engine: Arc<dyn Engine>,
        only_subnets: bool,
    ) -> Result<Arc<dyn Netstack>, NetstackError> {
        Ok(Arc::new(UserspaceStack::new(internals, engine, only_subnets)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsSettings;
    use crate::engine::{EngineConfig, EngineError, EngineStatus, UserspaceEngine, WireConfig};
    use crate::monitor::{LinkMonitor, LinkState};
    use crate::router::RouterSettings;
    use std::time::Duration;

    /// Engine without introspection
    struct Opaque;

    impl Engine for Opaque {
        fn status(&self) -> Result<EngineStatus, EngineError> {
            Err(EngineError::Closed)
        }
        fn reconfig(&self, _: &WireConfig) -> Result<(), EngineError> {
            Ok(())
        }
        fn set_router(&self, _: &RouterSettings) -> Result<(), EngineError> {
            Ok(())
        }
        fn set_dns(&self, _: &DnsSettings) -> Result<(), EngineError> {
            Ok(())
        }
        fn link_change(&self, _: &LinkState) {}
        fn close(&self) {}
        fn wait(&self) {}
    }

    fn userspace_engine() -> Arc<dyn Engine> {
        let monitor = Arc::new(LinkMonitor::with_scanner(Duration::from_secs(60), LinkState::default));
        Arc::new(UserspaceEngine::new(EngineConfig::new(0, monitor)).unwrap())
    }

    #[test]
    fn test_mode_precedence() {
        let forced = NetstackPolicy::resolve(Some(true), Platform::Linux);
        assert_eq!(forced.mode(false), NetstackMode::SubnetOnly);
        // Userspace transport always takes everything
        assert_eq!(forced.mode(true), NetstackMode::FullTakeover);

        let suppressed = NetstackPolicy::resolve(Some(false), Platform::Windows);
        assert_eq!(suppressed.mode(false), NetstackMode::None);

        assert_eq!(NetstackPolicy::resolve(None, Platform::MacOs).mode(false), NetstackMode::SubnetOnly);
        assert_eq!(NetstackPolicy::resolve(None, Platform::Linux).mode(false), NetstackMode::None);
    }

    #[test]
    fn test_bridge_none_is_noop() {
        let engine: Arc<dyn Engine> = Arc::new(Opaque);
        assert!(bridge(NetstackMode::None, &engine, &UserspaceStackFactory).unwrap().is_none());
    }

    #[test]
    fn test_bridge_requires_internals() {
        let engine: Arc<dyn Engine> = Arc::new(Opaque);
        let err = bridge(NetstackMode::FullTakeover, &engine, &UserspaceStackFactory).err();
        assert!(matches!(err, Some(NetstackError::Unsupported)));
    }

    #[test]
    fn test_bridge_starts_stack_in_mode() {
        let engine = userspace_engine();
        let stack = bridge(NetstackMode::SubnetOnly, &engine, &UserspaceStackFactory)
            .unwrap()
            .unwrap();
        assert!(stack.only_subnets());
        stack.close();
        stack.close();
        engine.close();
    }
}
