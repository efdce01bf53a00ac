pub mod config;
pub mod stack;
pub mod types;

pub use stack::{build_graph, service_spec, set_image_tag};
pub use types::{Backend, Config, ConfigError, ConfigResult};
