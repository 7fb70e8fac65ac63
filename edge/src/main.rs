//! # Tunnel Edge
//!
//! Hosts the control channel agents connect to and the public HTTP surface
//! callers tunnel requests through.
//!
//! ## Architecture
//!
//! ```text
//! Caller ──HTTP──► tunnel-edged ──WS control channel──► Agent ──HTTP──► Local service
//! ```
//!
//! ## Modules
//!
//! - [`auth`]   — control-channel pre-connect authorizer
//! - [`api`]    — read-only REST reflection endpoints
//! - [`config`] — environment-sourced configuration
//! - [`error`]  — Edge Handler error taxonomy
//! - [`routes`] — the tunneled-request, upload-url, and poll endpoints
//! - [`state`]  — shared application state
//! - [`ws`]     — control channel upgrade, connection lifecycle, dispatcher

mod api;
mod auth;
mod config;
mod error;
mod routes;
mod state;
mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{any, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tunnel_store::{MemoryConnectionRegistry, MemoryObjectStore, MemoryStore};

use crate::auth::InMemoryCredentialVerifier;
use crate::config::Config;
use crate::state::{AppState, EdgeState};

/// Periodically sweeps TTL-expired pending entries (§4.1 `Expire`, §5).
fn spawn_expiry_sweeper(store: Arc<dyn tunnel_store::PendingRequestStore>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(60));
        loop {
            tick.tick().await;
            match store.expire_sweep().await {
                Ok(n) if n > 0 => info!(expired = n, "swept expired pending requests"),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "expiry sweep failed"),
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tunnel_edge=info".into()),
        )
        .init();

    let config = Config::from_env();
    let bind_addr = config.bind_addr;

    let store: Arc<dyn tunnel_store::PendingRequestStore> = Arc::new(MemoryStore::new());
    let registry: Arc<dyn tunnel_store::ConnectionRegistry> =
        Arc::new(MemoryConnectionRegistry::new());
    let objects: Arc<dyn tunnel_store::ObjectStore> = Arc::new(MemoryObjectStore::new());

    spawn_expiry_sweeper(store.clone());

    let app_state = AppState::new(store, registry, objects, config);

    // Onboarding (tunnel creation, credential issuance) is out of scope
    // (§1); a single development tunnel is seeded here so the edge is
    // immediately useful against a locally running agent.
    let verifier = Arc::new(InMemoryCredentialVerifier::new());
    let dev_tunnel = tunnel_store::TunnelId::from("dev");
    verifier.set_token(dev_tunnel.clone(), "dev-secret");
    app_state.hostnames.insert("dev".to_string(), dev_tunnel);

    let edge_state = EdgeState {
        app: app_state,
        verifier,
    };

    let app = build_router(edge_state);

    info!(%bind_addr, "tunnel edge listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(edge_state: EdgeState) -> Router {
    Router::new()
        .route("/control", get(ws::connect_handler))
        .route("/t/{subdomain}/{*path}", any(routes::tunnel_handler))
        .route(
            "/upload-url/{subdomain}/{*path}",
            post(routes::upload_url_handler),
        )
        .route("/poll/{request_id}", get(routes::poll_handler))
        .route(
            "/internal/upload-notify/{request_id}",
            post(routes::upload_notify_handler),
        )
        .route("/api/tunnels", get(api::list_tunnels))
        .route("/healthz", get(api::healthz))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(edge_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine as _;
    use http_body_util::BodyExt;
    use tower::ServiceExt;
    use tunnel_store::{MemoryConnectionRegistry, MemoryObjectStore, MemoryStore};

    fn test_edge_state() -> EdgeState {
        let store: Arc<dyn tunnel_store::PendingRequestStore> = Arc::new(MemoryStore::new());
        let registry: Arc<dyn tunnel_store::ConnectionRegistry> =
            Arc::new(MemoryConnectionRegistry::new());
        let objects: Arc<dyn tunnel_store::ObjectStore> = Arc::new(MemoryObjectStore::new());
        let mut config = Config::from_env();
        config.poll_interval = Duration::from_millis(5);
        config.poll_deadline = Duration::from_millis(500);
        let app = AppState::new(store, registry, objects, config);
        app.hostnames
            .insert("myapp".to_string(), tunnel_store::TunnelId::from("t1"));
        EdgeState {
            app,
            verifier: Arc::new(InMemoryCredentialVerifier::new()),
        }
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let router = build_router(test_edge_state());
        let response = router
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_subdomain_returns_404() {
        let router = build_router(test_edge_state());
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/t/nosuchapp/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::NOT_FOUND);
    }

    /// Drives a full tunnel round trip through the real router: binds a
    /// fake agent connection directly into the registry/connections maps
    /// (bypassing the WebSocket upgrade), lets it answer the pushed `proxy`
    /// frame the way the real Dispatcher would, and asserts the HTTP
    /// response the caller gets back matches (§8 scenario S1).
    #[tokio::test]
    async fn tunnel_handler_round_trips_an_inline_response() {
        let edge_state = test_edge_state();
        let tunnel_id = tunnel_store::TunnelId::from("t1");
        let conn_id = tunnel_store::ConnectionId::from("c1");
        edge_state
            .app
            .registry
            .bind(tunnel_id.clone(), conn_id.clone())
            .await
            .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<tunnel_protocol::Frame>();
        edge_state.app.connections.insert(conn_id, tx);

        let store = edge_state.app.store.clone();
        tokio::spawn(async move {
            if let Some(tunnel_protocol::Frame::Proxy(req)) = rx.recv().await {
                let id = tunnel_store::RequestId::from(req.request_id);
                let _ = store
                    .patch(
                        &id,
                        tunnel_store::Patch::CompleteInline {
                            status: 200,
                            headers: std::collections::HashMap::new(),
                            body: base64::engine::general_purpose::STANDARD
                                .encode(b"ok"),
                        },
                    )
                    .await;
            }
        });

        let router = build_router(edge_state);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/t/myapp/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");
    }

    /// A bound tunnel whose agent never answers must time out at the poll
    /// deadline rather than hang forever (§8 scenario S7).
    #[tokio::test]
    async fn tunnel_handler_returns_504_when_the_agent_never_responds() {
        let edge_state = test_edge_state();
        let tunnel_id = tunnel_store::TunnelId::from("t1");
        let conn_id = tunnel_store::ConnectionId::from("c1");
        edge_state
            .app
            .registry
            .bind(tunnel_id, conn_id.clone())
            .await
            .unwrap();
        // Bound but nobody drains the channel, so the push succeeds and the
        // poll loop simply never sees a terminal response before the deadline.
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel::<tunnel_protocol::Frame>();
        edge_state.app.connections.insert(conn_id, tx);

        let router = build_router(edge_state);
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/t/myapp/ping")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::GATEWAY_TIMEOUT);
    }

    /// The deferred-body side path: a caller requests an upload URL, PUTs a
    /// body directly into the object store (simulated here via `put_bytes`,
    /// standing in for the real presigned-PUT network hop), the upload-notify
    /// route fires, the agent answers the resulting `proxy` frame, and the
    /// caller's subsequent poll sees the completed response (§8 scenario S5).
    #[tokio::test]
    async fn deferred_upload_round_trips_through_upload_notify_and_poll() {
        let edge_state = test_edge_state();
        let tunnel_id = tunnel_store::TunnelId::from("t1");
        let conn_id = tunnel_store::ConnectionId::from("c1");
        edge_state
            .app
            .registry
            .bind(tunnel_id, conn_id.clone())
            .await
            .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<tunnel_protocol::Frame>();
        edge_state.app.connections.insert(conn_id, tx);

        let router = build_router(edge_state.clone());

        let upload_url_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/upload-url/myapp/upload")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"method":"POST"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(upload_url_response.status(), axum::http::StatusCode::OK);
        let body = upload_url_response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let request_id = parsed["request_id"].as_str().unwrap().to_string();

        // Stand in for the agent PUTting its body to the presigned URL.
        let key = tunnel_store::objectstore::request_key(&request_id);
        edge_state
            .app
            .objects
            .put_bytes(&key, b"uploaded body".to_vec())
            .await
            .unwrap();

        let notify_response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(format!("/internal/upload-notify/{request_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(notify_response.status(), axum::http::StatusCode::NO_CONTENT);

        let pushed = rx.recv().await.expect("a proxy frame was pushed");
        let tunnel_protocol::Frame::Proxy(req) = pushed else {
            panic!("expected a proxy frame");
        };
        assert_eq!(req.request_id, request_id);
        assert!(req.s3_request_get_url.is_some());

        edge_state
            .app
            .store
            .patch(
                &tunnel_store::RequestId::from(request_id.clone()),
                tunnel_store::Patch::CompleteInline {
                    status: 200,
                    headers: std::collections::HashMap::new(),
                    body: base64::engine::general_purpose::STANDARD.encode(b"done"),
                },
            )
            .await
            .unwrap();

        let poll_response = router
            .oneshot(
                Request::builder()
                    .uri(format!("/poll/{request_id}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(poll_response.status(), axum::http::StatusCode::OK);
        let body = poll_response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"done");
    }
}
