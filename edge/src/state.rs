//! # Edge Application State
//!
//! Holds everything the Edge Handler, Dispatcher, and connection lifecycle
//! hooks share: the Pending-Request Store, the Agent Connection Registry,
//! the Object Store Adapter, the live control-channel senders, and the
//! subdomain→tunnel mapping. Registries are `Arc`-wrapped trait objects so
//! the in-memory default and any AWS-backed implementation are
//! interchangeable (§4.1–§4.3); all of it is bundled behind a single
//! `Clone`-able struct, the same way a `DashMap`-backed app state usually is.

use std::sync::Arc;

use axum::extract::FromRef;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tunnel_protocol::Frame;
use tunnel_store::{ConnectionId, ConnectionRegistry, ObjectStore, PendingRequestStore, TunnelId};

use crate::auth::CredentialVerifier;
use crate::config::Config;

/// Outbound sender for a single control-channel connection. Writes are
/// serialized by the one task draining this channel and owning the
/// WebSocket sink (§5 "writer mutex").
pub type FrameTx = mpsc::UnboundedSender<Frame>;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PendingRequestStore>,
    pub registry: Arc<dyn ConnectionRegistry>,
    pub objects: Arc<dyn ObjectStore>,
    /// Live control-channel senders, keyed by connection_id. Populated on
    /// WebSocket upgrade, removed on disconnect.
    pub connections: Arc<DashMap<ConnectionId, FrameTx>>,
    /// External hostname mapping (§4.4 step 1). Tunnel lifecycle CRUD is
    /// out of scope (§1); this is the minimal read surface the Edge
    /// Handler needs, populated by whatever onboarding flow owns tunnel
    /// creation.
    pub hostnames: Arc<DashMap<String, TunnelId>>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn PendingRequestStore>,
        registry: Arc<dyn ConnectionRegistry>,
        objects: Arc<dyn ObjectStore>,
        config: Config,
    ) -> Self {
        Self {
            store,
            registry,
            objects,
            connections: Arc::new(DashMap::new()),
            hostnames: Arc::new(DashMap::new()),
            config: Arc::new(config),
        }
    }

    pub fn resolve_subdomain(&self, subdomain: &str) -> Option<TunnelId> {
        self.hostnames.get(subdomain).map(|e| e.clone())
    }
}

/// Top-level router state: the shared `AppState` plus the control channel's
/// credential verifier. Kept separate from `AppState` so handlers that
/// don't need authorization (the poll/proxy HTTP routes) can extract just
/// the piece they need via `FromRef`.
#[derive(Clone)]
pub struct EdgeState {
    pub app: AppState,
    pub verifier: Arc<dyn CredentialVerifier>,
}

impl FromRef<EdgeState> for AppState {
    fn from_ref(state: &EdgeState) -> Self {
        state.app.clone()
    }
}

impl FromRef<EdgeState> for Arc<dyn CredentialVerifier> {
    fn from_ref(state: &EdgeState) -> Self {
        state.verifier.clone()
    }
}
