//! Tunnel Devices
//!
//! Kernel virtual interfaces that carry tunneled traffic: IP-level (TUN)
//! or Ethernet-level (TAP). TAP devices can be enslaved to an existing
//! bridge.

use crate::config::is_root;
use std::fmt;
use std::io;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info, warn};
use tun::{AbstractDevice, Configuration, Layer};

/// Longest interface name the kernel accepts, including the NUL
const IFNAMSIZ: usize = 16;

/// Raw description of an open device, handed to the userspace stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunHandle {
    /// Interface name as assigned by the kernel
    pub name: String,
    /// Raw file descriptor, where the platform has one
    pub fd: Option<i32>,
    /// Ethernet frames instead of IP packets
    pub tap: bool,
}

/// An open tunnel device
pub trait TunDevice: Send + fmt::Debug {
    /// Interface name as assigned by the kernel
    fn name(&self) -> &str;

    /// Whether this is a link-layer device
    fn is_tap(&self) -> bool;

    /// Raw handle for packet I/O
    fn handle(&self) -> TunHandle;

    /// Close the device. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), DeviceError>;
}

/// Tunnel device errors
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("invalid interface name {0:?}")]
    InvalidName(String),

    #[error("creating interface {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: tun::Error,
    },

    #[error("attaching {name} to bridge {bridge}: {reason}")]
    Bridge {
        name: String,
        bridge: String,
        reason: String,
    },
}

fn validate_name(name: &str) -> Result<(), DeviceError> {
    let bad = name.is_empty()
        || name.len() >= IFNAMSIZ
        || name
            .chars()
            .any(|c| c == '/' || c == '\0' || c.is_whitespace());
    if bad {
        return Err(DeviceError::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Kernel tunnel device
pub struct KernelTun {
    name: String,
    tap: bool,
    device: Option<tun::Device>,
}

impl KernelTun {
    /// Create (or attach to) the named device, enslaving a TAP device to
    /// `bridge` when given.
    pub fn open(name: &str, tap: bool, bridge: Option<&str>) -> Result<Self, DeviceError> {
        validate_name(name)?;

        let mut config = Configuration::default();
        config
            .tun_name(name)
            .layer(if tap { Layer::L2 } else { Layer::L3 })
            .up();

        let create_err = |source| DeviceError::Create {
            name: name.to_string(),
            source,
        };
        let device = tun::create(&config).map_err(create_err)?;
        let actual = device.tun_name().map_err(create_err)?;

        let mut dev = Self {
            name: actual,
            tap,
            device: Some(device),
        };
        info!("Opened {} device {}", if tap { "TAP" } else { "TUN" }, dev.name);

        if let Some(bridge) = bridge {
            if let Err(e) = attach_bridge(&dev.name, bridge) {
                let _ = dev.close();
                return Err(e);
            }
        }
        Ok(dev)
    }
}

impl TunDevice for KernelTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_tap(&self) -> bool {
        self.tap
    }

    fn handle(&self) -> TunHandle {
        TunHandle {
            name: self.name.clone(),
            fd: self.device.as_ref().and_then(raw_fd),
            tap: self.tap,
        }
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        if self.device.take().is_some() {
            debug!("Closed device {}", self.name);
        }
        Ok(())
    }
}

impl fmt::Debug for KernelTun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelTun")
            .field("name", &self.name)
            .field("tap", &self.tap)
            .field("open", &self.device.is_some())
            .finish()
    }
}

fn attach_bridge(name: &str, bridge: &str) -> Result<(), DeviceError> {
    let fail = |reason: String| DeviceError::Bridge {
        name: name.to_string(),
        bridge: bridge.to_string(),
        reason,
    };
    run_ip(&["link", "set", "dev", name, "master", bridge]).map_err(|e| fail(e.to_string()))?;
    run_ip(&["link", "set", "dev", name, "up"]).map_err(|e| fail(e.to_string()))?;
    info!("Attached {} to bridge {}", name, bridge);
    Ok(())
}

/// Run `ip` with the given arguments, failing on a non-zero exit
pub(crate) fn run_ip(args: &[&str]) -> io::Result<()> {
    debug!("ip {}", args.join(" "));
    let output = Command::new("ip").args(args).output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "ip {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Log why a device may have failed to open.
///
/// Purely informational: the caller's error is returned unchanged.
pub fn diagnose(name: &str) {
    if !cfg!(target_os = "linux") {
        warn!("No tunnel diagnostics available on this platform");
        return;
    }
    if !Path::new("/dev/net/tun").exists() {
        warn!("/dev/net/tun does not exist; is the tun module available?");
    }
    if !Path::new("/sys/module/tun").exists() {
        warn!("tun kernel module is not loaded");
    }
    if !is_root() {
        warn!("Not running as root; creating {} likely needs CAP_NET_ADMIN", name);
    }
    if name.len() >= IFNAMSIZ {
        warn!("Interface name {:?} is longer than {} bytes", name, IFNAMSIZ - 1);
    }
    if Path::new("/sys/class/net").join(name).exists() {
        warn!("Interface {} already exists; another daemon may own it", name);
    }
}

/// Remove a leftover device from a previous run
pub fn cleanup(name: &str) {
    if !cfg!(target_os = "linux") {
        return;
    }
    if Path::new("/sys/class/net").join(name).exists() {
        match run_ip(&["link", "del", "dev", name]) {
            Ok(()) => info!("Removed stale interface {}", name),
            Err(e) => warn!("Removing interface {}: {}", name, e),
        }
    }
}

#[cfg(unix)]
fn raw_fd(device: &tun::Device) -> Option<i32> {
    use std::os::fd::AsRawFd;
    Some(device.as_raw_fd())
}

#[cfg(not(unix))]
fn raw_fd(_device: &tun::Device) -> Option<i32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_bad_names() {
        for name in ["", "bad/name", "has space", &"x".repeat(64)] {
            let err = KernelTun::open(name, false, None).unwrap_err();
            assert!(matches!(err, DeviceError::InvalidName(_)), "{name:?}: {err}");
        }
        assert!(validate_name("meshd0").is_ok());
        assert!(validate_name(&"x".repeat(IFNAMSIZ - 1)).is_ok());
    }

    #[test]
    fn test_diagnose_is_informational() {
        // Must never panic, whatever the host looks like
        diagnose("meshd-test0");
        diagnose(&"y".repeat(40));
    }
}
