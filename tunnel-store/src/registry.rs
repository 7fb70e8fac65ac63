//! # Agent Connection Registry
//!
//! Bidirectional mapping between `tunnel_id` and the `connection_id` of the
//! control-channel socket currently bound to it (§4.2), carrying the
//! `(status, updated_at)` pair the reconnect-grace window in §4.4 needs.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::StoreError;
use crate::ids::{ConnectionId, TunnelId};
use crate::pending::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStatus {
    Active,
    Inactive,
}

/// A tunnel's current binding (§3 "Tunnel binding", §4.2).
#[derive(Debug, Clone)]
pub struct TunnelBinding {
    pub connection_id: Option<ConnectionId>,
    pub status: TunnelStatus,
    pub updated_at_ms: u64,
}

impl TunnelBinding {
    fn inactive(updated_at_ms: u64) -> Self {
        Self {
            connection_id: None,
            status: TunnelStatus::Inactive,
            updated_at_ms,
        }
    }
}

#[async_trait]
pub trait ConnectionRegistry: Send + Sync {
    /// Binds `tunnel_id` to `connection_id`, setting status=active and
    /// stamping `updated_at`. Replaces any prior connection atomically —
    /// this is what makes agent reconnect (§4.5) safe.
    async fn bind(&self, tunnel_id: TunnelId, connection_id: ConnectionId)
        -> Result<(), StoreError>;

    /// Clears the binding for whichever tunnel references `connection_id`,
    /// setting status=inactive. Returns the tunnel that was unbound, if any.
    async fn unbind(&self, connection_id: &ConnectionId) -> Result<Option<TunnelId>, StoreError>;

    async fn get(&self, tunnel_id: &TunnelId) -> Result<Option<TunnelBinding>, StoreError>;

    async fn lookup_by_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<TunnelId>, StoreError>;
}

/// In-process registry: the control channel's socket lives in the same
/// process as the registry, so a `DashMap` is the natural backend — there
/// is no cross-process lookup to serve.
#[derive(Default)]
pub struct MemoryConnectionRegistry {
    by_tunnel: DashMap<TunnelId, TunnelBinding>,
    by_connection: DashMap<ConnectionId, TunnelId>,
}

impl MemoryConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnectionRegistry for MemoryConnectionRegistry {
    async fn bind(
        &self,
        tunnel_id: TunnelId,
        connection_id: ConnectionId,
    ) -> Result<(), StoreError> {
        // Reconnect: if this tunnel already pointed at a different
        // connection, drop that stale reverse-lookup entry first so no two
        // tunnels ever share a connection_id (§4.2 invariant).
        if let Some(prev) = self.by_tunnel.get(&tunnel_id) {
            if let Some(old_conn) = &prev.connection_id {
                if *old_conn != connection_id {
                    self.by_connection.remove(old_conn);
                }
            }
        }
        self.by_connection
            .insert(connection_id.clone(), tunnel_id.clone());
        self.by_tunnel.insert(
            tunnel_id,
            TunnelBinding {
                connection_id: Some(connection_id),
                status: TunnelStatus::Active,
                updated_at_ms: now_ms(),
            },
        );
        Ok(())
    }

    async fn unbind(&self, connection_id: &ConnectionId) -> Result<Option<TunnelId>, StoreError> {
        let Some((_, tunnel_id)) = self.by_connection.remove(connection_id) else {
            return Ok(None);
        };
        self.by_tunnel
            .insert(tunnel_id.clone(), TunnelBinding::inactive(now_ms()));
        Ok(Some(tunnel_id))
    }

    async fn get(&self, tunnel_id: &TunnelId) -> Result<Option<TunnelBinding>, StoreError> {
        Ok(self.by_tunnel.get(tunnel_id).map(|e| e.clone()))
    }

    async fn lookup_by_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<TunnelId>, StoreError> {
        Ok(self.by_connection.get(connection_id).map(|e| e.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_then_unbind_round_trips_status() {
        let reg = MemoryConnectionRegistry::new();
        let tunnel = TunnelId::from("t1");
        let conn = ConnectionId::from("c1");
        reg.bind(tunnel.clone(), conn.clone()).await.unwrap();
        let binding = reg.get(&tunnel).await.unwrap().unwrap();
        assert_eq!(binding.status, TunnelStatus::Active);
        assert_eq!(binding.connection_id, Some(conn.clone()));

        let unbound = reg.unbind(&conn).await.unwrap();
        assert_eq!(unbound, Some(tunnel.clone()));
        let binding = reg.get(&tunnel).await.unwrap().unwrap();
        assert_eq!(binding.status, TunnelStatus::Inactive);
        assert!(binding.connection_id.is_none());
    }

    #[tokio::test]
    async fn reconnect_replaces_connection_id_atomically() {
        let reg = MemoryConnectionRegistry::new();
        let tunnel = TunnelId::from("t1");
        let old_conn = ConnectionId::from("c1");
        let new_conn = ConnectionId::from("c2");
        reg.bind(tunnel.clone(), old_conn.clone()).await.unwrap();
        reg.bind(tunnel.clone(), new_conn.clone()).await.unwrap();

        assert!(reg.lookup_by_connection(&old_conn).await.unwrap().is_none());
        assert_eq!(
            reg.lookup_by_connection(&new_conn).await.unwrap(),
            Some(tunnel)
        );
    }
}
