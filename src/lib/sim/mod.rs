//! In-memory collaborators for the `sim` backend and for tests.

pub mod balancer;
pub mod cluster;
pub mod identity;
pub mod provider;
pub mod registry;

pub use balancer::SimBalancer;
pub use cluster::SimCluster;
pub use identity::StaticIdentity;
pub use provider::{CallCounts, SimProvider};
pub use registry::MemoryRegistry;
