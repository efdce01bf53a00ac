use thiserror::Error;

use crate::{
    config::ConfigError, deployment::DeploymentError, graph::GraphError, provisioner::ProvisionError,
    publisher::PublishError, runtime::RuntimeError, store::StoreError,
};

/// Any failure surfaced by the binary.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Provision(#[from] ProvisionError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error(transparent)]
    Deployment(#[from] DeploymentError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("status server failed: {0}")]
    Server(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
