//! OS DNS Configuration
//!
//! Points the host resolver at the mesh's nameservers while the tunnel is
//! up and restores the original configuration on close.

use std::fmt;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const RESOLV_CONF: &str = "/etc/resolv.conf";
const BACKUP_CONF: &str = "/etc/resolv.pre-meshd-backup.conf";

/// Desired resolver state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DnsSettings {
    pub nameservers: Vec<IpAddr>,
    pub search_domains: Vec<String>,
}

impl DnsSettings {
    /// Render as a resolv.conf(5) file
    fn render(&self, dev: &str) -> String {
        let mut out = format!("# resolv.conf(5) file generated by meshd for {dev}\n");
        out.push_str("# DO NOT EDIT THIS FILE BY HAND -- CHANGES WILL BE OVERWRITTEN\n\n");
        for ns in &self.nameservers {
            out.push_str(&format!("nameserver {ns}\n"));
        }
        if !self.search_domains.is_empty() {
            out.push_str(&format!("search {}\n", self.search_domains.join(" ")));
        }
        out
    }
}

/// Host resolver configurator
pub trait DnsConfigurator: Send + fmt::Debug {
    /// Apply `settings`; empty settings restore the host default
    fn set(&mut self, settings: &DnsSettings) -> Result<(), DnsError>;

    /// Restore the original configuration. Closing twice is a no-op.
    fn close(&mut self) -> Result<(), DnsError>;
}

/// DNS configuration errors
#[derive(Debug, thiserror::Error)]
pub enum DnsError {
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("DNS configurator closed")]
    Closed,

    #[error("OS DNS configuration is not supported on {0}")]
    Unsupported(&'static str),
}

fn io_err<'a>(op: &'static str, path: &'a Path) -> impl FnOnce(io::Error) -> DnsError + 'a {
    move |source| DnsError::Io {
        op,
        path: path.to_path_buf(),
        source,
    }
}

/// Configurator that rewrites resolv.conf, keeping a backup
pub struct ResolvConfManager {
    dev: String,
    path: PathBuf,
    backup: PathBuf,
    managing: bool,
    closed: bool,
}

impl ResolvConfManager {
    /// Manager for the system resolv.conf
    pub fn new(dev: &str) -> Result<Self, DnsError> {
        if !cfg!(unix) || cfg!(target_os = "macos") {
            return Err(DnsError::Unsupported(std::env::consts::OS));
        }
        Self::with_paths(dev, RESOLV_CONF, BACKUP_CONF)
    }

    /// Manager for an arbitrary file pair
    pub fn with_paths(
        dev: &str,
        path: impl Into<PathBuf>,
        backup: impl Into<PathBuf>,
    ) -> Result<Self, DnsError> {
        let path = path.into();
        // Fail early if the file cannot even be inspected
        std::fs::symlink_metadata(&path).map_err(io_err("inspecting", &path))?;
        debug!("DNS configurator for {} using {}", dev, path.display());
        Ok(Self {
            dev: dev.to_string(),
            path,
            backup: backup.into(),
            managing: false,
            closed: false,
        })
    }

    fn restore(&mut self) -> Result<(), DnsError> {
        if !self.managing {
            return Ok(());
        }
        std::fs::rename(&self.backup, &self.path).map_err(io_err("restoring", &self.path))?;
        self.managing = false;
        info!("Restored {}", self.path.display());
        Ok(())
    }

    /// Restore a backup left behind by a crashed daemon
    pub fn cleanup() {
        if !Path::new(BACKUP_CONF).exists() {
            return;
        }
        match std::fs::rename(BACKUP_CONF, RESOLV_CONF) {
            Ok(()) => info!("Restored {} from stale backup", RESOLV_CONF),
            Err(e) => warn!("Restoring {}: {}", RESOLV_CONF, e),
        }
    }
}

impl DnsConfigurator for ResolvConfManager {
    fn set(&mut self, settings: &DnsSettings) -> Result<(), DnsError> {
        if self.closed {
            return Err(DnsError::Closed);
        }
        if settings.nameservers.is_empty() {
            return self.restore();
        }
        if !self.managing {
            std::fs::copy(&self.path, &self.backup).map_err(io_err("backing up", &self.path))?;
            self.managing = true;
        }
        std::fs::write(&self.path, settings.render(&self.dev))
            .map_err(io_err("writing", &self.path))?;
        info!(
            "DNS for {}: {} nameservers, {} search domains",
            self.dev,
            settings.nameservers.len(),
            settings.search_domains.len()
        );
        Ok(())
    }

    fn close(&mut self) -> Result<(), DnsError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.restore()
    }
}

impl fmt::Debug for ResolvConfManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvConfManager")
            .field("dev", &self.dev)
            .field("path", &self.path)
            .field("managing", &self.managing)
            .finish()
    }
}
