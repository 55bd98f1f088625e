//! Kubernetes Secrets Client
//!
//! Minimal client for the secrets API, used when daemon state lives in a
//! Kubernetes secret instead of a file. Credentials come from the pod's
//! service account.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::ACCEPT;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Where the pod's service account credentials are mounted
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

const DEFAULT_API_URL: &str = "https://kubernetes.default.svc";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Kubernetes API errors
#[derive(Debug, thiserror::Error)]
pub enum KubeError {
    #[error("reading service account {}: {source}", path.display())]
    ServiceAccount {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("kubernetes API request: {0}")]
    Http(#[from] reqwest::Error),

    #[error("kubernetes API returned {code}: {message}")]
    Status { code: u16, message: String },

    #[error("secret {secret} key {key}: {reason}")]
    Data {
        secret: String,
        key: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
}

/// A `v1/Secret`. Values in `data` are base64 encoded on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn new(name: &str) -> Self {
        Self {
            api_version: "v1".into(),
            kind: "Secret".into(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: String::new(),
            },
            data: BTreeMap::new(),
        }
    }

    /// Decoded value of `key`
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KubeError> {
        self.data
            .get(key)
            .map(|v| {
                STANDARD.decode(v).map_err(|e| KubeError::Data {
                    secret: self.metadata.name.clone(),
                    key: key.to_string(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    pub fn insert(&mut self, key: &str, value: &[u8]) {
        self.data.insert(key.to_string(), STANDARD.encode(value));
    }
}

/// Error body the API server sends with non-2xx responses
#[derive(Debug, Default, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

/// Secrets client scoped to one namespace
#[derive(Clone)]
pub struct KubeClient {
    url: String,
    namespace: String,
    token: String,
    http: reqwest::Client,
}

impl KubeClient {
    /// Client for an explicit API endpoint. `ca_pem` adds a trusted root.
    pub fn new(
        url: &str,
        namespace: &str,
        token: &str,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self, KubeError> {
        let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
        if let Some(pem) = ca_pem {
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(pem)?);
        }
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            namespace: namespace.to_string(),
            token: token.to_string(),
            http: builder.build()?,
        })
    }

    /// Client for the in-cluster API using the pod's service account
    pub fn from_service_account() -> Result<Self, KubeError> {
        Self::from_service_account_dir(Path::new(SERVICE_ACCOUNT_DIR))
    }

    pub fn from_service_account_dir(dir: &Path) -> Result<Self, KubeError> {
        let read = |file: &str| {
            let path = dir.join(file);
            std::fs::read(&path).map_err(|source| KubeError::ServiceAccount { path, source })
        };
        let namespace = String::from_utf8_lossy(&read("namespace")?).trim().to_string();
        let token = String::from_utf8_lossy(&read("token")?).trim().to_string();
        let ca = read("ca.crt")?;
        Self::new(DEFAULT_API_URL, &namespace, &token, Some(&ca))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn secret_url(&self, name: Option<&str>) -> String {
        let base = format!("{}/api/v1/namespaces/{}/secrets", self.url, self.namespace);
        match name {
            Some(name) => format!("{base}/{name}"),
            None => base,
        }
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<&Secret>,
    ) -> Result<reqwest::Response, KubeError> {
        debug!("kube {} {}", method, url);
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&self.token)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, KubeError> {
        let code = response.status();
        if code.is_success() {
            return Ok(response);
        }
        let status = response.json::<ApiStatus>().await.unwrap_or_default();
        Err(KubeError::Status {
            code: code.as_u16(),
            message: status.message,
        })
    }

    /// Fetch a secret; `None` when it does not exist
    pub async fn get_secret(&self, name: &str) -> Result<Option<Secret>, KubeError> {
        let response = self.send(Method::GET, self.secret_url(Some(name)), None).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let secret = Self::check(response).await?.json::<Secret>().await?;
        Ok(Some(secret))
    }

    pub async fn create_secret(&self, secret: &Secret) -> Result<(), KubeError> {
        let mut secret = secret.clone();
        secret.metadata.namespace = self.namespace.clone();
        let response = self.send(Method::POST, self.secret_url(None), Some(&secret)).await?;
        Self::check(response).await.map(drop)
    }

    pub async fn update_secret(&self, secret: &Secret) -> Result<(), KubeError> {
        let url = self.secret_url(Some(&secret.metadata.name));
        let response = self.send(Method::PUT, url, Some(secret)).await?;
        Self::check(response).await.map(drop)
    }
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("url", &self.url)
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process stand-in for the secrets API

    use super::Secret;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::net::SocketAddr;
    use std::sync::Arc;

    pub const TOKEN: &str = "t0k3n";

    #[derive(Clone, Default)]
    pub struct FakeApi {
        pub secrets: Arc<Mutex<BTreeMap<String, Secret>>>,
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == format!("Bearer {TOKEN}"))
    }

    fn status(code: StatusCode, message: &str) -> Response {
        (code, Json(json!({ "kind": "Status", "message": message, "code": code.as_u16() })))
            .into_response()
    }

    async fn create(
        State(api): State<FakeApi>,
        headers: HeaderMap,
        Path(ns): Path<String>,
        Json(secret): Json<Secret>,
    ) -> Response {
        if !authorized(&headers) {
            return status(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
        if secret.metadata.namespace != ns {
            return status(StatusCode::BAD_REQUEST, "namespace mismatch");
        }
        let mut secrets = api.secrets.lock();
        if secrets.contains_key(&secret.metadata.name) {
            return status(StatusCode::CONFLICT, "already exists");
        }
        secrets.insert(secret.metadata.name.clone(), secret.clone());
        (StatusCode::CREATED, Json(secret)).into_response()
    }

    async fn fetch(
        State(api): State<FakeApi>,
        headers: HeaderMap,
        Path((_ns, name)): Path<(String, String)>,
    ) -> Response {
        if !authorized(&headers) {
            return status(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
        match api.secrets.lock().get(&name) {
            Some(secret) => Json(secret.clone()).into_response(),
            None => status(StatusCode::NOT_FOUND, "not found"),
        }
    }

    async fn replace(
        State(api): State<FakeApi>,
        headers: HeaderMap,
        Path((_ns, name)): Path<(String, String)>,
        Json(secret): Json<Secret>,
    ) -> Response {
        if !authorized(&headers) {
            return status(StatusCode::UNAUTHORIZED, "Unauthorized");
        }
        let mut secrets = api.secrets.lock();
        if !secrets.contains_key(&name) {
            return status(StatusCode::NOT_FOUND, "not found");
        }
        secrets.insert(name, secret.clone());
        Json(secret).into_response()
    }

    /// Serve the fake API on a loopback port
    pub async fn spawn() -> (FakeApi, SocketAddr) {
        let api = FakeApi::default();
        let app = Router::new()
            .route("/api/v1/namespaces/:ns/secrets", axum::routing::post(create))
            .route("/api/v1/namespaces/:ns/secrets/:name", get(fetch).put(replace))
            .with_state(api.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (api, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(addr: std::net::SocketAddr, token: &str) -> KubeClient {
        KubeClient::new(&format!("http://{addr}"), "meshd", token, None).unwrap()
    }

    #[tokio::test]
    async fn test_secret_create_get_update() {
        let (api, addr) = fake::spawn().await;
        let client = client(addr, fake::TOKEN);

        assert!(client.get_secret("meshd-state").await.unwrap().is_none());

        let mut secret = Secret::new("meshd-state");
        secret.insert("state", b"{\"starts\":1}");
        client.create_secret(&secret).await.unwrap();
        assert_eq!(api.secrets.lock()["meshd-state"].metadata.namespace, "meshd");

        let mut fetched = client.get_secret("meshd-state").await.unwrap().unwrap();
        assert_eq!(fetched.get("state").unwrap().unwrap(), b"{\"starts\":1}");
        assert_eq!(fetched.get("missing").unwrap(), None);

        fetched.insert("state", b"{\"starts\":2}");
        client.update_secret(&fetched).await.unwrap();
        let stored = api.secrets.lock()["meshd-state"].clone();
        assert_eq!(stored.data["state"], STANDARD.encode(b"{\"starts\":2}"));
    }

    #[tokio::test]
    async fn test_api_errors_carry_status() {
        let (_api, addr) = fake::spawn().await;
        let err = client(addr, "wrong").get_secret("meshd-state").await.unwrap_err();
        match err {
            KubeError::Status { code, message } => {
                assert_eq!(code, 401);
                assert_eq!(message, "Unauthorized");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_corrupt_secret_value() {
        let mut secret = Secret::new("meshd-state");
        secret.data.insert("state".into(), "not base64!".into());
        assert!(matches!(secret.get("state"), Err(KubeError::Data { .. })));
    }

    #[test]
    fn test_missing_service_account() {
        let dir = std::env::temp_dir().join(format!("meshd-kube-sa-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("namespace"), "meshd\n").unwrap();

        match KubeClient::from_service_account_dir(&dir) {
            Err(KubeError::ServiceAccount { path, .. }) => assert_eq!(path, dir.join("token")),
            other => panic!("unexpected {other:?}"),
        }
    }
}
