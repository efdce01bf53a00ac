pub mod balancer;
pub mod docker;
pub mod registry;
pub mod retry;
pub mod types;

pub use balancer::HttpBalancer;
pub use docker::DockerRuntime;
pub use registry::DockerImageStore;
pub use types::{
    ClusterRuntime, HealthStatus, IdentityProvider, InstanceHandle, LoadBalancer, RuntimeError, RuntimeResult,
};
