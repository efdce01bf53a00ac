pub mod controller;
pub mod health;
pub mod state;
pub mod supervisor;
pub mod types;

pub use controller::Controller;
pub use supervisor::{ServiceStatus, ServiceSupervisor};
pub use types::{DeploymentError, DeploymentResult, DeploymentRun, ServiceSpec, TaskTemplate, TemplateVersion};
