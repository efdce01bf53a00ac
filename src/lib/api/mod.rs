pub mod api;

pub use api::StatusServer;
