//! # REST API Endpoints
//!
//! Read-only reflection of registry state. Tunnel lifecycle CRUD (creating
//! a subdomain, issuing credentials) lives outside this service (§1); this
//! is just enough surface for a dashboard or health check to see what's
//! bound right now.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct TunnelListItem {
    pub tunnel_id: String,
    pub subdomain: String,
    pub status: &'static str,
}

/// `GET /api/tunnels` — currently bound tunnels and their connection status.
pub async fn list_tunnels(State(state): State<AppState>) -> Json<Vec<TunnelListItem>> {
    let mut items = Vec::new();
    for entry in state.hostnames.iter() {
        let subdomain = entry.key().clone();
        let tunnel_id = entry.value().clone();
        let status = match state.registry.get(&tunnel_id).await {
            Ok(Some(binding)) => match binding.status {
                tunnel_store::TunnelStatus::Active => "active",
                tunnel_store::TunnelStatus::Inactive => "inactive",
            },
            _ => "unknown",
        };
        items.push(TunnelListItem {
            tunnel_id: tunnel_id.as_str().to_string(),
            subdomain,
            status,
        });
    }
    Json(items)
}

/// `GET /healthz` — liveness probe.
pub async fn healthz() -> &'static str {
    "ok"
}
