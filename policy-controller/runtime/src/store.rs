use crate::{core::ResourceId, k8s};
use anyhow::Result;

/// Reads the declared state of a policy.
#[async_trait::async_trait]
pub trait AuthConfigStore: Send + Sync {
    /// Returns `None` when the policy does not exist.
    async fn get(&self, id: &ResourceId) -> Result<Option<k8s::AuthConfig>>;
}

/// Reads values from secrets referenced by policies.
#[async_trait::async_trait]
pub trait SecretAccessor: Send + Sync {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Vec<u8>, SecretError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret {namespace}/{name} not found")]
    NotFound { namespace: String, name: String },

    #[error("secret {namespace}/{name} has no key {key}")]
    MissingKey {
        namespace: String,
        name: String,
        key: String,
    },

    #[error(transparent)]
    Api(#[from] k8s::Error),
}

/// Reads policies and secrets from the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: k8s::Client,
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: k8s::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl AuthConfigStore for KubeStore {
    async fn get(&self, id: &ResourceId) -> Result<Option<k8s::AuthConfig>> {
        let api = k8s::Api::<k8s::AuthConfig>::namespaced(self.client.clone(), &id.namespace);
        Ok(api.get_opt(&id.name).await?)
    }
}

#[async_trait::async_trait]
impl SecretAccessor for KubeStore {
    async fn get_secret(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Vec<u8>, SecretError> {
        let api = k8s::Api::<k8s::Secret>::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Err(SecretError::NotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        };
        secret
            .data
            .and_then(|mut data| data.remove(key))
            .map(|k8s::ByteString(bytes)| bytes)
            .ok_or_else(|| SecretError::MissingKey {
                namespace: namespace.to_string(),
                name: name.to_string(),
                key: key.to_string(),
            })
    }
}
