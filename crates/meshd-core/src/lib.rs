//! meshd core - transport selection and engine supervision
//!
//! Building blocks for the mesh VPN daemon: picks a transport among
//! kernel tunnel, link-layer bridge and pure userspace networking,
//! composes the engine around it, and exposes the pieces the daemon's
//! supervisor wires together.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         meshd process                         │
//! │                                                               │
//! │  --tun a,b,c ──▶ TransportSelector ──▶ EngineComposer         │
//! │                        │              (device → router → dns) │
//! │                        ▼                                      │
//! │                     Engine ──▶ NetstackBridge (optional)      │
//! │                        │                                      │
//! │                        ▼                                      │
//! │                    Watchdog ──▶ ControlServer (Unix socket)   │
//! │                                   └─▶ StateStore (file/secret)│
//! │                                                               │
//! │  ProxyListener (SOCKS5) ──▶ Dialer (netstack or host)         │
//! │  LinkMonitor (shared, closed last)                            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Resource Ownership
//!
//! - Within one candidate, resources are acquired device, router, dns
//!   and released in the exact reverse order on failure
//! - Exactly one engine is live per process
//! - Shutdown reaches the engine only through the watchdog

mod composer;
mod config;
mod device;
mod dns;
mod engine;
mod kube;
mod monitor;
mod netstack;
mod proxy;
mod router;
mod selector;
mod server;
mod state;
mod watchdog;

#[cfg(test)]
mod testutil;

pub use composer::{Backend, ComposeError, EngineComposer, SystemBackend};
pub use config::{
    Candidate, ConfigError, DaemonConfig, Environment, Platform, Settings, StateLocation,
    TransportSpec,
    ENV_PLATFORM, ENV_WRAP_NETSTACK, USERSPACE_NETWORKING,
};
pub use device::{DeviceError, KernelTun, TunDevice, TunHandle};
pub use dns::{DnsConfigurator, DnsError, DnsSettings, ResolvConfManager};
pub use engine::{
    Engine, EngineConfig, EngineError, EngineParts, EngineStatus, Internals, TransportKind,
    UserspaceEngine, WireConfig, WirePeer,
};
pub use kube::{KubeClient, KubeError, ObjectMeta, Secret, SERVICE_ACCOUNT_DIR};
pub use monitor::{CallbackId, ChangeCallback, LinkMonitor, LinkState};
pub use netstack::{
    bridge, Netstack, NetstackError, NetstackFactory, NetstackMode, NetstackPolicy,
    UserspaceStack, UserspaceStackFactory,
};
pub use proxy::{Dialer, DialFuture, ProxyConfig, ProxyError, ProxyListener, SystemDialer, TargetAddr};
pub use router::{KernelRouter, Router, RouterError, RouterSettings, SubnetRouterWrapper};
pub use selector::{AttemptError, SelectError, Selection, TransportAttemptError, TransportSelector};
pub use server::{
    ControlServer, DebugHandle, DebugProvider, LocalApiServer, ServerError, ServerOptions,
};
pub use state::{DaemonState, StateStore, SECRET_STATE_KEY};
pub use ipnet::IpNet;
pub use watchdog::{abort_process, RecoveryAction, Watchdog, DEFAULT_STALL_TIMEOUT};

/// Tunnel device diagnostics and crash cleanup
pub mod diagnostics {
    pub use crate::device::{cleanup, diagnose};
}
