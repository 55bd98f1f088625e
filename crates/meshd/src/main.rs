//! meshd: mesh VPN client daemon
//!
//! Entry point. Dispatches alternate entry points (service install,
//! debug), resolves configuration, installs logging and hands control to
//! the lifecycle supervisor.

mod debug;
mod logpolicy;
mod service;
mod supervisor;

use clap::Parser;
use logpolicy::LogPolicy;
use meshd_core::{
    diagnostics, Candidate, ConfigError, DaemonConfig, Environment, KernelRouter, LocalApiServer,
    Platform, ResolvConfManager, Settings, SystemBackend, UserspaceStackFactory,
};
use service::VariantTable;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use supervisor::{DaemonError, Supervisor};
use tracing::{error, info};

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Mesh VPN client daemon
#[derive(Debug, Parser)]
#[command(name = "meshd", version, about)]
pub struct Args {
    /// Tunnel interface candidates, comma separated.
    /// "userspace-networking" runs without a kernel device;
    /// "tap:NAME[:BRIDGE]" creates a link-layer device.
    #[arg(long)]
    tun: Option<String>,

    /// UDP port to listen on for peer traffic (0 = automatic)
    #[arg(long)]
    port: Option<u16>,

    /// Optional [ip]:port to run a SOCKS5 server on
    #[arg(long = "socks5-server", value_name = "ADDR")]
    socks5_server: Option<String>,

    /// Listen address ([ip]:port) of the optional debug server
    #[arg(long, value_name = "ADDR")]
    debug: Option<String>,

    /// Path of the state file
    #[arg(long, value_name = "PATH")]
    state: Option<PathBuf>,

    /// Kubernetes secret to keep state in instead of --state
    #[arg(long = "kube-secret", value_name = "NAME")]
    kube_secret: Option<String>,

    /// Path of the control socket
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,

    /// Log verbosity (0 = info, 1 = debug, 2+ = trace)
    #[arg(long, short = 'v', value_name = "LEVEL")]
    verbose: Option<u8>,

    /// Clean up leftover system state and exit
    #[arg(long)]
    cleanup: bool,

    /// TOML file with defaults for the flags above
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            tun: self.tun.clone(),
            port: self.port,
            socks5_server: self.socks5_server.clone(),
            debug: self.debug.clone(),
            state: self.state.clone(),
            kube_secret: self.kube_secret.clone(),
            socket: self.socket.clone(),
            verbose: self.verbose,
            cleanup: self.cleanup.then_some(true),
        }
    }

    /// File settings overlaid by flags, then resolved against the environment
    fn resolve(&self, env: &Environment) -> Result<DaemonConfig, ConfigError> {
        let file = match &self.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        DaemonConfig::resolve(file.overlay(self.settings()), env)
    }
}

fn main() -> ExitCode {
    ignore_sigpipe();

    let argv: Vec<String> = std::env::args().skip(1).collect();
    let variants = VariantTable::for_platform(Platform::current());
    if let Some(result) = variants.dispatch(&argv) {
        return match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("meshd: {e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let args = Args::parse();
    let config = match args.resolve(&Environment::capture()) {
        Ok(config) => config,
        Err(e) => {
            let e = DaemonError::from(e);
            eprintln!("meshd: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    let log = match LogPolicy::init(config.verbose, config.state_dir()) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("meshd: {e:#}");
            LogPolicy::disabled()
        }
    };

    if config.cleanup {
        cleanup(&config);
        log.shutdown(supervisor::LOG_FLUSH_DEADLINE);
        return ExitCode::SUCCESS;
    }

    run(config, log)
}

fn run(config: DaemonConfig, log: LogPolicy) -> ExitCode {
    info!(
        "meshd {} starting on {} (tun {})",
        env!("CARGO_PKG_VERSION"),
        config.platform,
        config.transports
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("meshd-worker")
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Building tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(async move {
        let signals = supervisor::os_signals().map_err(DaemonError::Signals)?;
        Supervisor::new(
            config,
            Arc::new(SystemBackend),
            Arc::new(UserspaceStackFactory),
            LocalApiServer,
        )
        .run(log, signals)
        .await
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // The supervisor has already logged the cause
            if matches!(e, DaemonError::Signals(_)) {
                error!("{}", e);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

/// Undo system changes left behind by an unclean exit
fn cleanup(config: &DaemonConfig) {
    info!("Cleaning up system state");
    ResolvConfManager::cleanup();
    for candidate in config.transports.candidates() {
        match candidate {
            Candidate::Tun(name) => KernelRouter::cleanup(name),
            Candidate::Tap { name, .. } => diagnostics::cleanup(name),
            Candidate::Userspace => {}
        }
    }
}

/// `meshd debug [flags]`: print what the daemon would do, then exit
pub(crate) fn debug_variant(args: &[String]) -> anyhow::Result<()> {
    let args = Args::try_parse_from(std::iter::once("meshd debug".to_string()).chain(args.iter().cloned()))?;
    let config = args.resolve(&Environment::capture())?;

    println!("platform:    {}", config.platform);
    println!("transports:  {}", config.transports);
    println!("port:        {}", config.port);
    println!("socks5:      {}", config.socks_addr.as_deref().unwrap_or("off"));
    println!("debug addr:  {}", config.debug_addr.as_deref().unwrap_or("off"));
    println!("state:       {}", display_path(config.state_path.as_ref()));
    println!("kube secret: {}", config.kube_secret.as_deref().unwrap_or("none"));
    println!("socket:      {}", display_path(config.socket_path.as_ref()));
    println!("wrap router: {}", config.netstack.wrap);
    for candidate in config.transports.candidates() {
        println!(
            "  {:<24} netstack {:?}",
            candidate.to_string(),
            config.netstack.mode(candidate.is_userspace())
        );
    }

    // Diagnostics go to the log
    for name in config.transports.candidates().iter().filter_map(Candidate::device_name) {
        diagnostics::diagnose(name);
    }
    Ok(())
}

fn display_path(path: Option<&PathBuf>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "none".into())
}

#[cfg(unix)]
fn ignore_sigpipe() {
    // SAFETY: installing SIG_IGN has no preconditions.
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

#[cfg(not(unix))]
fn ignore_sigpipe() {}

#[cfg(test)]
mod tests {
    use super::*;
    use meshd_core::StateLocation;

    fn linux_env() -> Environment {
        Environment {
            platform: Some("linux".into()),
            ..Environment::default()
        }
    }

    #[test]
    fn test_flags_override_file() {
        let dir = std::env::temp_dir().join(format!("meshd-main-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("meshd.toml");
        std::fs::write(&file, "tun = \"file0\"\nport = 41641\n").unwrap();

        let args = Args::try_parse_from([
            "meshd",
            "--config",
            file.to_str().unwrap(),
            "--tun",
            "flag0,userspace-networking",
        ])
        .unwrap();
        let config = args.resolve(&linux_env()).unwrap();

        assert_eq!(config.transports.to_string(), "flag0,userspace-networking");
        assert_eq!(config.port, 41641);
    }

    #[test]
    fn test_kube_secret_flag_replaces_state_path() {
        let args = Args::try_parse_from(["meshd", "--state", "", "--kube-secret", "meshd"]).unwrap();
        let config = args.resolve(&linux_env()).unwrap();
        assert_eq!(
            config.state_location(),
            Some(StateLocation::KubeSecret("meshd".into()))
        );
    }

    #[test]
    fn test_invalid_tun_is_config_error() {
        let args = Args::try_parse_from(["meshd", "--tun", "meshd0,,meshd1"]).unwrap();
        let err = DaemonError::from(args.resolve(&linux_env()).unwrap_err());
        assert_eq!(err.exit_code(), 2);
    }
}
