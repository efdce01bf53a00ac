use async_trait::async_trait;

use crate::runtime::types::{IdentityProvider, RuntimeResult};

/// Issues a fixed identity reference per task family.
#[derive(Debug, Clone, Default)]
pub struct StaticIdentity {
    prefix: String,
}

impl StaticIdentity {
    pub fn new(prefix: impl Into<String>) -> Self {
        StaticIdentity { prefix: prefix.into() }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn issue(&self, family: &str, permissions: &[String]) -> RuntimeResult<String> {
        let prefix = if self.prefix.is_empty() { "identity" } else { &self.prefix };
        Ok(format!("{prefix}/{family}-execution+{}", permissions.len()))
    }
}
