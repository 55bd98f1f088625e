//! Debug HTTP endpoint
//!
//! Bound only when `--debug` is given. Serves process statistics and the
//! JSON pages registered on the shared [`DebugHandle`].

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use meshd_core::DebugHandle;
use serde_json::json;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Routes for the debug endpoint
pub fn router(handle: DebugHandle) -> Router {
    Router::new()
        .route("/debug/", get(index_handler))
        .route("/debug/vars", get(vars_handler))
        .route("/debug/:name", get(page_handler))
        .with_state(handle)
}

/// Bind `addr` for the debug endpoint
pub async fn bind(addr: &str) -> std::io::Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!("Debug endpoint on http://{}/debug/", listener.local_addr()?);
    Ok(listener)
}

/// Serve until `token` is cancelled
pub async fn serve(listener: TcpListener, handle: DebugHandle, token: CancellationToken) {
    let app = router(handle);
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
    {
        warn!("Debug endpoint stopped: {}", e);
    }
}

async fn index_handler(State(handle): State<DebugHandle>) -> impl IntoResponse {
    let mut pages = vec!["vars".to_string()];
    pages.extend(handle.names());
    Json(json!({ "pages": pages }))
}

async fn vars_handler() -> impl IntoResponse {
    match tokio::task::spawn_blocking(process_vars).await {
        Ok(vars) => (StatusCode::OK, Json(vars)),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

async fn page_handler(
    State(handle): State<DebugHandle>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match tokio::task::spawn_blocking(move || handle.render(&name).ok_or(name)).await {
        Ok(Ok(page)) => (StatusCode::OK, Json(page)),
        Ok(Err(name)) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no debug page {name:?}") })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        ),
    }
}

/// Memory and CPU of this process
fn process_vars() -> serde_json::Value {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        true,
        ProcessRefreshKind::everything(),
    );

    match system.process(pid) {
        Some(process) => json!({
            "pid": pid.as_u32(),
            "rss_bytes": process.memory(),
            "virtual_bytes": process.virtual_memory(),
            "cpu_percent": process.cpu_usage(),
            "uptime_secs": process.run_time(),
        }),
        None => json!({ "pid": pid.as_u32() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_serves_registered_pages() {
        let handle = DebugHandle::new();
        handle.register("engine", Arc::new(|| json!({ "transport": "userspace" })));

        let listener = bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let token = CancellationToken::new();
        let server = tokio::spawn(serve(listener, handle, token.clone()));

        let engine = get(addr, "/debug/engine").await;
        assert!(engine.starts_with("HTTP/1.1 200"));
        assert!(engine.contains("\"transport\":\"userspace\""));

        let missing = get(addr, "/debug/nope").await;
        assert!(missing.starts_with("HTTP/1.1 404"));

        let vars = get(addr, "/debug/vars").await;
        assert!(vars.contains("\"pid\""));

        token.cancel();
        server.await.unwrap();
    }

    #[test]
    fn test_process_vars_has_pid() {
        let vars = process_vars();
        assert_eq!(vars["pid"], std::process::id());
    }
}
