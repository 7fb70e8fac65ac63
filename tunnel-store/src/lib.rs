//! Shared state backends for the tunnel correlation engine: the
//! Pending-Request Store, the Agent Connection Registry, and the Object
//! Store Adapter (design §4.1–§4.3, §3).

pub mod error;
pub mod ids;
pub mod objectstore;
pub mod pending;
pub mod registry;

#[cfg(feature = "dynamo")]
pub mod dynamo;
#[cfg(feature = "s3")]
pub mod s3;

pub use error::StoreError;
pub use ids::{generate_request_id, ConnectionId, RequestId, TunnelId};
pub use objectstore::{MemoryObjectStore, ObjectStore};
pub use pending::{MemoryStore, Patch, PendingRequest, PendingRequestStore, PendingStatus, ResponseView};
pub use registry::{ConnectionRegistry, MemoryConnectionRegistry, TunnelBinding, TunnelStatus};

#[cfg(feature = "dynamo")]
pub use dynamo::DynamoStore;
#[cfg(feature = "s3")]
pub use s3::S3ObjectStore;
