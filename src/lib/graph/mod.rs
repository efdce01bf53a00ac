pub mod graph;
pub mod types;

pub use graph::ResourceGraph;
pub use types::{GraphError, GraphResult, Resource, ResourceConfig, ResourceKind};
