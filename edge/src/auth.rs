//! # Control-Channel Authorization
//!
//! A pre-connect authorizer validates the bearer credential an agent
//! presents when opening the control channel and binds the connection to a
//! `tunnel_id` (§6). Credential issuance itself is out of scope (§1,
//! external collaborator) — this is just the verification interface the
//! connection hook calls before binding the registry.
//!
//! Design §9 open question 4 describes the reference implementation's
//! credential check as a full table scan and recommends an indexed lookup
//! "without changing any invariants"; `InMemoryCredentialVerifier` resolves
//! that by keying directly on `tunnel_id`, which is already the index the
//! rest of the system looks up by.

use async_trait::async_trait;
use dashmap::DashMap;
use tunnel_store::TunnelId;

#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, tunnel_id: &TunnelId, bearer_token: &str) -> bool;
}

/// Indexed (`tunnel_id` → token) verifier, suitable for the edge's
/// in-process default and for tests. A production deployment would back
/// this with the same tenant/credential table tunnel lifecycle CRUD writes
/// to (out of scope here, per §1).
#[derive(Default)]
pub struct InMemoryCredentialVerifier {
    tokens: DashMap<TunnelId, String>,
}

impl InMemoryCredentialVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_token(&self, tunnel_id: TunnelId, token: impl Into<String>) {
        self.tokens.insert(tunnel_id, token.into());
    }
}

#[async_trait]
impl CredentialVerifier for InMemoryCredentialVerifier {
    async fn verify(&self, tunnel_id: &TunnelId, bearer_token: &str) -> bool {
        self.tokens
            .get(tunnel_id)
            .is_some_and(|t| t.as_str() == bearer_token)
    }
}
