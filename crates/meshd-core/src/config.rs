//! Daemon Configuration
//!
//! Command-line flags, the optional TOML file and the debug environment
//! overrides are resolved exactly once into a [`DaemonConfig`]. Nothing
//! downstream reads the process environment again.

use crate::netstack::NetstackPolicy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Transport candidate that runs without any kernel tunnel device.
pub const USERSPACE_NETWORKING: &str = "userspace-networking";

/// Prefix of link-layer (TAP) transport candidates.
const TAP_PREFIX: &str = "tap:";

/// Environment variable forcing (or suppressing) subnet netstack wrapping.
pub const ENV_WRAP_NETSTACK: &str = "MESHD_DEBUG_WRAP_NETSTACK";

/// Environment variable making the daemon behave as another platform.
pub const ENV_PLATFORM: &str = "MESHD_DEBUG_PLATFORM";

/// Platform the daemon behaves as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    /// Linux on a Synology NAS (no reliable TUN support)
    Synology,
    Windows,
    MacOs,
    FreeBsd,
    OpenBsd,
    Other,
}

impl Platform {
    /// Platform of the running binary
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            if Path::new("/etc/synoinfo.conf").exists() {
                Platform::Synology
            } else {
                Platform::Linux
            }
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "freebsd") {
            Platform::FreeBsd
        } else if cfg!(target_os = "openbsd") {
            Platform::OpenBsd
        } else {
            Platform::Other
        }
    }

    /// Short lowercase name, as accepted by [`ENV_PLATFORM`]
    pub fn name(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Synology => "synology",
            Platform::Windows => "windows",
            Platform::MacOs => "darwin",
            Platform::FreeBsd => "freebsd",
            Platform::OpenBsd => "openbsd",
            Platform::Other => "other",
        }
    }

    /// Default `--tun` value
    pub fn default_transports(&self) -> &'static str {
        match self {
            Platform::OpenBsd => "tun",
            Platform::Windows => "Meshd",
            // "utun" lets the kernel pick any free utunN device
            Platform::MacOs => "utun",
            Platform::Synology => "meshd0,userspace-networking",
            _ => "meshd0",
        }
    }

    /// Whether the kernel router is wrapped so a netstack serves subnet routes
    pub fn wraps_netstack_by_default(&self) -> bool {
        matches!(
            self,
            Platform::Synology | Platform::Windows | Platform::MacOs | Platform::FreeBsd
        )
    }

    /// Whether a control socket path is mandatory
    pub fn requires_socket(&self) -> bool {
        !matches!(self, Platform::Windows)
    }

    pub fn default_state_path(&self) -> PathBuf {
        match self {
            Platform::Windows => PathBuf::from(r"C:\ProgramData\meshd\server-state.conf"),
            Platform::MacOs => PathBuf::from("/Library/meshd/meshd.state"),
            Platform::FreeBsd | Platform::OpenBsd => PathBuf::from("/var/db/meshd/meshd.state"),
            _ => PathBuf::from("/var/lib/meshd/meshd.state"),
        }
    }

    pub fn default_socket_path(&self) -> Option<PathBuf> {
        match self {
            Platform::Windows => None,
            Platform::MacOs => Some(PathBuf::from("/var/run/meshd.socket")),
            _ => Some(PathBuf::from("/var/run/meshd/meshd.sock")),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Platform {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linux" => Ok(Platform::Linux),
            "synology" => Ok(Platform::Synology),
            "windows" => Ok(Platform::Windows),
            "darwin" | "macos" => Ok(Platform::MacOs),
            "freebsd" => Ok(Platform::FreeBsd),
            "openbsd" => Ok(Platform::OpenBsd),
            _ => Err(ConfigError::UnknownPlatform(s.to_string())),
        }
    }
}

/// One transport candidate from `--tun`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// Kernel IP tunnel device (e.g. "meshd0")
    Tun(String),
    /// No kernel device; a userspace network stack takes all traffic
    Userspace,
    /// Link-layer device, optionally enslaved to a bridge
    Tap {
        name: String,
        bridge: Option<String>,
    },
}

impl Candidate {
    pub fn is_userspace(&self) -> bool {
        matches!(self, Candidate::Userspace)
    }

    pub fn is_tap(&self) -> bool {
        matches!(self, Candidate::Tap { .. })
    }

    /// Kernel device name, if this candidate creates one
    pub fn device_name(&self) -> Option<&str> {
        match self {
            Candidate::Tun(name) | Candidate::Tap { name, .. } => Some(name),
            Candidate::Userspace => None,
        }
    }
}

impl FromStr for Candidate {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ConfigError::InvalidCandidate(s.to_string()));
        }
        if s == USERSPACE_NETWORKING {
            return Ok(Candidate::Userspace);
        }
        if let Some(rest) = s.strip_prefix(TAP_PREFIX) {
            let mut parts = rest.split(':');
            let name = parts.next().unwrap_or_default();
            let bridge = parts.next();
            if name.is_empty() || bridge == Some("") || parts.next().is_some() {
                return Err(ConfigError::InvalidCandidate(s.to_string()));
            }
            return Ok(Candidate::Tap {
                name: name.to_string(),
                bridge: bridge.map(str::to_string),
            });
        }
        Ok(Candidate::Tun(s.to_string()))
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Candidate::Tun(name) => f.write_str(name),
            Candidate::Userspace => f.write_str(USERSPACE_NETWORKING),
            Candidate::Tap { name, bridge: None } => write!(f, "{TAP_PREFIX}{name}"),
            Candidate::Tap {
                name,
                bridge: Some(bridge),
            } => write!(f, "{TAP_PREFIX}{name}:{bridge}"),
        }
    }
}

/// Ordered transport candidates; the first that starts wins
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSpec {
    candidates: Vec<Candidate>,
}

impl TransportSpec {
    pub fn new(candidates: Vec<Candidate>) -> Result<Self, ConfigError> {
        if candidates.is_empty() {
            return Err(ConfigError::NoTransports);
        }
        Ok(Self { candidates })
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Whether any candidate avoids the kernel tunnel device
    pub fn has_userspace(&self) -> bool {
        self.candidates.iter().any(Candidate::is_userspace)
    }
}

impl FromStr for TransportSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Err(ConfigError::NoTransports);
        }
        let candidates = s
            .split(',')
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(candidates)
    }
}

impl fmt::Display for TransportSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, candidate) in self.candidates.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{candidate}")?;
        }
        Ok(())
    }
}

/// Raw settings from the config file or the command line.
///
/// Every field is optional so a file can be overlaid by flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Comma-separated transport candidates
    pub tun: Option<String>,
    /// UDP port for peer traffic (0 = automatic)
    pub port: Option<u16>,
    /// SOCKS5 listen address
    pub socks5_server: Option<String>,
    /// Debug HTTP listen address
    pub debug: Option<String>,
    pub state: Option<PathBuf>,
    /// Kubernetes secret holding state instead of a file
    pub kube_secret: Option<String>,
    pub socket: Option<PathBuf>,
    pub verbose: Option<u8>,
    pub cleanup: Option<bool>,
}

impl Settings {
    /// Load settings from a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Overlay `other` on top of `self`; fields set in `other` win
    pub fn overlay(self, other: Settings) -> Settings {
        Settings {
            tun: other.tun.or(self.tun),
            port: other.port.or(self.port),
            socks5_server: other.socks5_server.or(self.socks5_server),
            debug: other.debug.or(self.debug),
            state: other.state.or(self.state),
            kube_secret: other.kube_secret.or(self.kube_secret),
            socket: other.socket.or(self.socket),
            verbose: other.verbose.or(self.verbose),
            cleanup: other.cleanup.or(self.cleanup),
        }
    }
}

/// Process-level inputs that are not flags
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    /// Raw value of [`ENV_WRAP_NETSTACK`]
    pub wrap_netstack: Option<String>,
    /// Raw value of [`ENV_PLATFORM`]
    pub platform: Option<String>,
    /// Effective uid is 0
    pub is_root: bool,
}

impl Environment {
    /// Snapshot the process environment
    pub fn capture() -> Self {
        Self {
            wrap_netstack: std::env::var(ENV_WRAP_NETSTACK).ok().filter(|v| !v.is_empty()),
            platform: std::env::var(ENV_PLATFORM).ok().filter(|v| !v.is_empty()),
            is_root: is_root(),
        }
    }
}

#[cfg(unix)]
pub(crate) fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub(crate) fn is_root() -> bool {
    false
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "1" | "t" | "true" => Ok(true),
        "0" | "f" | "false" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var,
            value: value.to_string(),
        }),
    }
}

/// Backend for persisted daemon state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateLocation {
    File(PathBuf),
    KubeSecret(String),
}

/// Fully resolved daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub transports: TransportSpec,
    pub port: u16,
    pub socks_addr: Option<String>,
    pub debug_addr: Option<String>,
    pub state_path: Option<PathBuf>,
    pub kube_secret: Option<String>,
    pub socket_path: Option<PathBuf>,
    pub verbose: u8,
    pub cleanup: bool,
    pub platform: Platform,
    pub netstack: NetstackPolicy,
}

impl DaemonConfig {
    /// Resolve settings and environment into a validated configuration
    pub fn resolve(settings: Settings, env: &Environment) -> Result<Self, ConfigError> {
        let platform = match &env.platform {
            Some(name) => name.parse()?,
            None => Platform::current(),
        };

        let wrap_override = env
            .wrap_netstack
            .as_deref()
            .map(|v| parse_bool(ENV_WRAP_NETSTACK, v))
            .transpose()?;

        let transports: TransportSpec = settings
            .tun
            .as_deref()
            .unwrap_or(platform.default_transports())
            .parse()?;

        let config = Self {
            transports,
            port: settings.port.unwrap_or(0),
            socks_addr: settings.socks5_server.filter(|a| !a.is_empty()),
            debug_addr: settings.debug.filter(|a| !a.is_empty()),
            state_path: Some(
                settings
                    .state
                    .unwrap_or_else(|| platform.default_state_path()),
            )
            .filter(|p| !p.as_os_str().is_empty()),
            kube_secret: settings.kube_secret.filter(|s| !s.is_empty()),
            socket_path: settings
                .socket
                .or_else(|| platform.default_socket_path())
                .filter(|p| !p.as_os_str().is_empty()),
            verbose: settings.verbose.unwrap_or(0),
            cleanup: settings.cleanup.unwrap_or(false),
            platform,
            netstack: NetstackPolicy::resolve(wrap_override, platform),
        };
        config.validate(env)?;
        Ok(config)
    }

    /// Check required inputs
    pub fn validate(&self, env: &Environment) -> Result<(), ConfigError> {
        if self.platform == Platform::MacOs
            && !env.is_root
            && !self.transports.has_userspace()
            && !self.cleanup
        {
            return Err(ConfigError::RequiresRoot);
        }
        if self.cleanup {
            return Ok(());
        }
        if self.socket_path.is_none() && self.platform.requires_socket() {
            return Err(ConfigError::MissingSocket);
        }
        if self.state_location().is_none() {
            return Err(ConfigError::MissingState);
        }
        Ok(())
    }

    /// Where daemon state is kept; a secret takes precedence over a file
    pub fn state_location(&self) -> Option<StateLocation> {
        match (&self.kube_secret, &self.state_path) {
            (Some(secret), _) => Some(StateLocation::KubeSecret(secret.clone())),
            (None, Some(path)) => Some(StateLocation::File(path.clone())),
            (None, None) => None,
        }
    }

    /// Directory holding the state file, used for log files
    pub fn state_dir(&self) -> Option<&Path> {
        self.state_path
            .as_deref()
            .and_then(Path::parent)
            .filter(|p| !p.as_os_str().is_empty())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no --tun value specified")]
    NoTransports,

    #[error("invalid transport candidate {0:?}")]
    InvalidCandidate(String),

    #[error("--socket is required")]
    MissingSocket,

    #[error("--state or --kube-secret is required")]
    MissingState,

    #[error("meshd requires root; use sudo meshd (or use --tun=userspace-networking)")]
    RequiresRoot,

    #[error("invalid {var} value {value:?}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("unknown platform {0:?}")]
    UnknownPlatform(String),

    #[error("reading {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
}
