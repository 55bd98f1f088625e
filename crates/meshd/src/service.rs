//! Alternate entry points
//!
//! `meshd install-system-daemon` and friends run instead of the daemon.
//! The table is built once per process; a variant the platform cannot
//! support is present but disabled so the error can name the platform.

use crate::logpolicy::LogPolicy;
use anyhow::{bail, Context, Result};
use meshd_core::Platform;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use tracing::info;

const SERVICE_NAME: &str = "meshd";
const SYSTEMD_UNIT_DIR: &str = "/etc/systemd/system";

/// Entry point taking the arguments after the variant name
pub type VariantFn = fn(&[String]) -> Result<()>;

#[derive(Debug, Clone, Copy)]
pub enum Variant {
    Enabled(VariantFn),
    Disabled,
}

/// Variant names and their entry points for one platform
#[derive(Debug)]
pub struct VariantTable {
    platform: Platform,
    entries: BTreeMap<&'static str, Variant>,
}

impl VariantTable {
    pub fn for_platform(platform: Platform) -> Self {
        let systemd = |f: VariantFn| match platform {
            Platform::Linux => Variant::Enabled(f),
            _ => Variant::Disabled,
        };

        let mut entries = BTreeMap::new();
        entries.insert("install-system-daemon", systemd(install_system_daemon));
        entries.insert("uninstall-system-daemon", systemd(uninstall_system_daemon));
        entries.insert("debug", Variant::Enabled(crate::debug_variant));
        Self { platform, entries }
    }

    pub fn get(&self, name: &str) -> Option<Variant> {
        self.entries.get(name).copied()
    }

    /// Run the variant named by `args[0]`, if there is one.
    ///
    /// `None` means the daemon should start normally.
    pub fn dispatch(&self, args: &[String]) -> Option<Result<()>> {
        let (name, rest) = args.split_first()?;
        match self.get(name)? {
            Variant::Enabled(f) => {
                let _log = LogPolicy::init(0, None).ok();
                Some(f(rest))
            }
            Variant::Disabled => Some(Err(anyhow::anyhow!(
                "{} not available on {}",
                name,
                self.platform
            ))),
        }
    }
}

fn unit_path() -> PathBuf {
    PathBuf::from(SYSTEMD_UNIT_DIR).join(format!("{SERVICE_NAME}.service"))
}

fn unit_file(exe: &std::path::Path) -> String {
    format!(
        r#"[Unit]
Description=meshd mesh VPN daemon
Wants=network-pre.target
After=network-pre.target NetworkManager.service systemd-resolved.service

[Service]
ExecStartPre={exe} --cleanup
ExecStart={exe}
ExecStopPost={exe} --cleanup
Restart=on-failure
RuntimeDirectory=meshd
RuntimeDirectoryMode=0755
StateDirectory=meshd
StateDirectoryMode=0700
Type=simple

[Install]
WantedBy=multi-user.target
"#,
        exe = exe.display()
    )
}

fn systemctl(args: &[&str]) -> Result<()> {
    let output = Command::new("systemctl")
        .args(args)
        .output()
        .with_context(|| format!("running systemctl {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "systemctl {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

fn install_system_daemon(args: &[String]) -> Result<()> {
    if !args.is_empty() {
        bail!("install-system-daemon takes no arguments");
    }
    let exe = std::env::current_exe().context("locating meshd binary")?;
    let path = unit_path();
    std::fs::write(&path, unit_file(&exe))
        .with_context(|| format!("writing {}", path.display()))?;
    info!("Wrote {}", path.display());

    systemctl(&["daemon-reload"])?;
    systemctl(&["enable", SERVICE_NAME])?;
    systemctl(&["restart", SERVICE_NAME])?;
    info!("Service {} enabled and started", SERVICE_NAME);
    Ok(())
}

fn uninstall_system_daemon(args: &[String]) -> Result<()> {
    if !args.is_empty() {
        bail!("uninstall-system-daemon takes no arguments");
    }
    // Best effort: the unit may already be stopped or disabled
    let _ = systemctl(&["stop", SERVICE_NAME]);
    let _ = systemctl(&["disable", SERVICE_NAME]);

    let path = unit_path();
    match std::fs::remove_file(&path) {
        Ok(()) => info!("Removed {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("removing {}", path.display())),
    }
    systemctl(&["daemon-reload"])
}
