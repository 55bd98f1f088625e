//! Control-Plane Server
//!
//! Serves local clients over a Unix socket for as long as the daemon
//! runs. The supervisor hands it the watchdog-wrapped engine and a
//! cancellation token; cancellation is the normal way for it to return.

use crate::config::StateLocation;
use crate::engine::{Engine, EngineStatus};
use crate::kube::KubeError;
use crate::state::StateStore;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Produces one JSON document for the debug endpoint
pub type DebugProvider = Arc<dyn Fn() -> serde_json::Value + Send + Sync>;

/// Named debug pages, shared between the server and the HTTP endpoint
#[derive(Clone, Default)]
pub struct DebugHandle {
    providers: Arc<RwLock<BTreeMap<String, DebugProvider>>>,
}

impl DebugHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str, provider: DebugProvider) {
        self.providers.write().insert(name.to_string(), provider);
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.read().keys().cloned().collect()
    }

    /// Render the named page, if registered
    pub fn render(&self, name: &str) -> Option<serde_json::Value> {
        let provider = self.providers.read().get(name).cloned()?;
        Some(provider())
    }
}

impl std::fmt::Debug for DebugHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugHandle").field("pages", &self.names()).finish()
    }
}

/// Everything the server needs besides the engine
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub socket_path: Option<PathBuf>,
    pub state: StateLocation,
    pub debug: Option<DebugHandle>,
}

/// Control-plane server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The context was cancelled; not a failure
    #[error("server canceled")]
    Canceled,

    #[error("listening on {}: {source}", path.display())]
    Listen {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state file {}: {source}", path.display())]
    State {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("state secret: {0}")]
    Kube(#[from] KubeError),

    #[error("no control socket configured")]
    NoSocket,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Long-running local API server
pub trait ControlServer: Send + Sync {
    /// Serve until `token` is cancelled or a fatal error occurs.
    ///
    /// Returns [`ServerError::Canceled`] after cancellation.
    fn run(
        &self,
        token: CancellationToken,
        engine: Arc<dyn Engine>,
        options: ServerOptions,
    ) -> impl Future<Output = Result<(), ServerError>> + Send;
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Status(EngineStatus),
    Message { ok: bool, message: String },
}

/// Line-oriented JSON API on a Unix socket.
///
/// Requests are single words: `ping`, `status`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalApiServer;

impl LocalApiServer {
    fn respond(engine: &dyn Engine, request: &str) -> Response {
        match request.trim() {
            "ping" => Response::Message {
                ok: true,
                message: "pong".into(),
            },
            "status" => match engine.status() {
                Ok(status) => Response::Status(status),
                Err(e) => Response::Message {
                    ok: false,
                    message: e.to_string(),
                },
            },
            other => Response::Message {
                ok: false,
                message: format!("unknown request {other:?}"),
            },
        }
    }
}

impl ControlServer for LocalApiServer {
    async fn run(
        &self,
        token: CancellationToken,
        engine: Arc<dyn Engine>,
        options: ServerOptions,
    ) -> Result<(), ServerError> {
        let store = StateStore::open(&options.state)?;
        let mut state = store.load().await?;
        state.starts += 1;
        state.last_start_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        store.save(&state).await?;

        if let Some(debug) = &options.debug {
            let snapshot = state.clone();
            debug.register(
                "state",
                Arc::new(move || serde_json::to_value(&snapshot).unwrap_or_default()),
            );
        }

        let socket_path = options.socket_path.as_deref().ok_or(ServerError::NoSocket)?;
        serve_socket(&token, engine, socket_path).await
    }
}

#[cfg(unix)]
async fn serve_socket(
    token: &CancellationToken,
    engine: Arc<dyn Engine>,
    path: &Path,
) -> Result<(), ServerError> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    let listen_err = |source| ServerError::Listen {
        path: path.to_path_buf(),
        source,
    };
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(listen_err)?;
    }
    // A stale socket from a previous run blocks bind
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(listen_err(e)),
    }
    let listener = UnixListener::bind(path).map_err(listen_err)?;
    info!("Control server listening on {}", path.display());

    let result = loop {
        let (stream, _) = tokio::select! {
            _ = token.cancelled() => break Err(ServerError::Canceled),
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => break Err(ServerError::Io(e)),
            },
        };

        let engine = engine.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            loop {
                let line = tokio::select! {
                    _ = token.cancelled() => break,
                    line = lines.next_line() => line,
                };
                let Ok(Some(line)) = line else { break };
                // Engine calls may block up to the watchdog bound
                let engine = engine.clone();
                let response = match tokio::task::spawn_blocking(move || {
                    LocalApiServer::respond(engine.as_ref(), &line)
                })
                .await
                {
                    Ok(response) => response,
                    Err(e) => Response::Message {
                        ok: false,
                        message: e.to_string(),
                    },
                };
                let mut out = serde_json::to_vec(&response).unwrap_or_default();
                out.push(b'\n');
                if let Err(e) = write.write_all(&out).await {
                    debug!("Control client went away: {}", e);
                    break;
                }
            }
        });
    };

    if let Err(e) = std::fs::remove_file(path) {
        warn!("Removing {}: {}", path.display(), e);
    }
    result
}

#[cfg(not(unix))]
async fn serve_socket(
    token: &CancellationToken,
    _engine: Arc<dyn Engine>,
    path: &Path,
) -> Result<(), ServerError> {
    warn!("Unix sockets unavailable; {} not served", path.display());
    token.cancelled().await;
    Err(ServerError::Canceled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::DnsSettings;
    use crate::engine::{EngineConfig, EngineError, TransportKind, UserspaceEngine, WireConfig};
    use crate::monitor::{LinkMonitor, LinkState};
    use crate::router::RouterSettings;
    use std::time::Duration;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("meshd-server-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn engine() -> Arc<dyn Engine> {
        let monitor = Arc::new(LinkMonitor::with_scanner(Duration::from_secs(60), LinkState::default));
        Arc::new(UserspaceEngine::new(EngineConfig::new(0, monitor)).unwrap())
    }

    #[cfg(unix)]
    async fn connect(socket: &Path) -> tokio::net::UnixStream {
        for _ in 0..100 {
            if let Ok(s) = tokio::net::UnixStream::connect(socket).await {
                return s;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("server never listened on {}", socket.display());
    }

    fn options(dir: &Path, debug: Option<DebugHandle>) -> ServerOptions {
        ServerOptions {
            socket_path: Some(dir.join("meshd.sock")),
            state: StateLocation::File(dir.join("meshd.state")),
            debug,
        }
    }

    /// Engine whose `status` blocks until released
    struct Stuck {
        release: crossbeam_channel::Receiver<()>,
    }

    impl Engine for Stuck {
        fn status(&self) -> Result<EngineStatus, EngineError> {
            let _ = self.release.recv_timeout(Duration::from_secs(5));
            Ok(EngineStatus {
                transport: TransportKind::Userspace,
                tun_name: None,
                listen_port: 0,
                peers: 0,
                link_changes: 0,
                closed: false,
            })
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

    #[test]
    fn test_debug_handle_renders_registered_pages() {
        let debug = DebugHandle::new();
        debug.register("engine", Arc::new(|| serde_json::json!({"peers": 0})));
        assert_eq!(debug.names(), vec!["engine"]);
        assert_eq!(debug.render("engine").unwrap()["peers"], 0);
        assert!(debug.render("missing").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_serves_until_canceled() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let dir = scratch("run");
        let socket = dir.join("meshd.sock");
        let debug = DebugHandle::new();
        let options = options(&dir, Some(debug.clone()));
        let token = CancellationToken::new();
        let engine = engine();
        let server = tokio::spawn({
            let token = token.clone();
            let engine = engine.clone();
            async move { LocalApiServer.run(token, engine, options).await }
        });

        let (read, mut write) = connect(&socket).await.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"ping\nstatus\n").await.unwrap();
        let pong = lines.next_line().await.unwrap().unwrap();
        assert!(pong.contains("pong"));
        let status: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(status["transport"], "userspace");
        assert_eq!(debug.render("state").unwrap()["starts"], 1);

        token.cancel();
        let result = server.await.unwrap();
        assert!(matches!(result, Err(ServerError::Canceled)));
        assert!(!socket.exists());
        engine.close();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_slow_engine_does_not_stall_other_clients() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let dir = scratch("slow");
        let socket = dir.join("meshd.sock");
        let (release, stuck) = crossbeam_channel::bounded(1);
        let token = CancellationToken::new();
        let server = tokio::spawn({
            let token = token.clone();
            let options = options(&dir, None);
            async move { LocalApiServer.run(token, Arc::new(Stuck { release: stuck }), options).await }
        });

        let (slow_read, mut slow_write) = connect(&socket).await.into_split();
        slow_write.write_all(b"status\n").await.unwrap();

        // Single-threaded runtime: a blocked worker would starve this client
        let (read, mut write) = connect(&socket).await.into_split();
        write.write_all(b"ping\n").await.unwrap();
        let pong = tokio::time::timeout(
            Duration::from_secs(2),
            BufReader::new(read).lines().next_line(),
        )
        .await
        .expect("ping answered while status is stuck")
        .unwrap()
        .unwrap();
        assert!(pong.contains("pong"));

        release.send(()).unwrap();
        let status = BufReader::new(slow_read).lines().next_line().await.unwrap().unwrap();
        assert!(status.contains("userspace"));

        token.cancel();
        assert!(matches!(server.await.unwrap(), Err(ServerError::Canceled)));
    }
}
