//! Provisioning and zero-downtime rolling deployment of a load-balanced
//! container service.

pub mod api;
pub mod config;
pub mod deployment;
pub mod error;
pub mod graph;
pub mod provisioner;
pub mod publisher;
pub mod runtime;
pub mod sim;
pub mod store;

pub use error::{Error, Result};
