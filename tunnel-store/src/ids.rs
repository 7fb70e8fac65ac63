//! Newtype identifiers.
//!
//! `request_id`, `tunnel_id`, and `connection_id` are all plain strings on
//! the wire, but keeping them as distinct types at the API boundary is what
//! actually enforces §3's invariants ("a request_id appears in at most one
//! pending_request", "no two tunnels share a connection_id") — a function
//! that takes a `TunnelId` cannot be handed a `RequestId` by mistake.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(RequestId);
string_id!(TunnelId);
string_id!(ConnectionId);

/// Generates a fresh `request_id`: 16 random bytes, hex-encoded (§3).
pub fn generate_request_id() -> RequestId {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    RequestId(hex::encode(bytes))
}
