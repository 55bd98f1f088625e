//! Daemon State Store
//!
//! Persisted daemon state lives either in a JSON file or under one key of
//! a Kubernetes secret. File I/O runs on the blocking pool.

use crate::config::StateLocation;
use crate::kube::{KubeClient, KubeError, Secret};
use crate::server::ServerError;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Key of the state document inside the secret
pub const SECRET_STATE_KEY: &str = "meshd-state";

/// Persisted daemon state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonState {
    pub starts: u64,
    pub last_start_unix: u64,
}

impl DaemonState {
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let state_err = |source| ServerError::State {
            path: path.to_path_buf(),
            source,
        };
        match std::fs::read(path) {
            Ok(bytes) => Self::decode(&bytes).map_err(state_err),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(state_err(e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ServerError> {
        let state_err = |source| ServerError::State {
            path: path.to_path_buf(),
            source,
        };
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(state_err)?;
        }
        let json = self.encode().map_err(state_err)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).map_err(state_err)?;
        std::fs::rename(&tmp, path).map_err(state_err)
    }

    fn decode(bytes: &[u8]) -> io::Result<Self> {
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    fn encode(&self) -> io::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Open state backend
#[derive(Debug)]
pub enum StateStore {
    File(PathBuf),
    KubeSecret { client: KubeClient, secret: String },
}

impl StateStore {
    /// Open the configured backend. A secret store needs the pod's
    /// service account.
    pub fn open(location: &StateLocation) -> Result<Self, ServerError> {
        match location {
            StateLocation::File(path) => Ok(Self::File(path.clone())),
            StateLocation::KubeSecret(secret) => {
                let client = KubeClient::from_service_account()?;
                info!("State in secret {}/{}", client.namespace(), secret);
                Ok(Self::KubeSecret {
                    client,
                    secret: secret.clone(),
                })
            }
        }
    }

    pub async fn load(&self) -> Result<DaemonState, ServerError> {
        match self {
            Self::File(path) => {
                let path = path.clone();
                tokio::task::spawn_blocking(move || DaemonState::load(&path))
                    .await
                    .map_err(|e| ServerError::Io(io::Error::other(e)))?
            }
            Self::KubeSecret { client, secret } => {
                let Some(stored) = client.get_secret(secret).await? else {
                    debug!("Secret {} does not exist yet", secret);
                    return Ok(DaemonState::default());
                };
                match stored.get(SECRET_STATE_KEY)? {
                    Some(bytes) => DaemonState::decode(&bytes).map_err(|e| {
                        ServerError::Kube(KubeError::Data {
                            secret: secret.clone(),
                            key: SECRET_STATE_KEY.to_string(),
                            reason: e.to_string(),
                        })
                    }),
                    None => Ok(DaemonState::default()),
                }
            }
        }
    }

    pub async fn save(&self, state: &DaemonState) -> Result<(), ServerError> {
        match self {
            Self::File(path) => {
                let path = path.clone();
                let state = state.clone();
                tokio::task::spawn_blocking(move || state.save(&path))
                    .await
                    .map_err(|e| ServerError::Io(io::Error::other(e)))?
            }
            Self::KubeSecret { client, secret } => {
                let bytes = state.encode()?;
                match client.get_secret(secret).await? {
                    Some(mut stored) => {
                        stored.insert(SECRET_STATE_KEY, &bytes);
                        client.update_secret(&stored).await?;
                    }
                    None => {
                        let mut created = Secret::new(secret);
                        created.insert(SECRET_STATE_KEY, &bytes);
                        client.create_secret(&created).await?;
                    }
                }
                Ok(())
            }
        }
    }
}
