use crate::{pipeline::AuthPipeline, ResourceId};
use std::sync::Arc;

/// The result of claiming a host for a policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Registration {
    /// The host was not previously claimed and now routes to the policy.
    Linked,

    /// The host was already claimed by the same policy.
    Unchanged,

    /// The host is claimed by another policy. The existing entry is kept.
    Collision { owner: ResourceId },
}

/// Routes hostnames to the policies that claim them and holds each policy's published pipeline.
///
/// Implementations must allow concurrent reads while writes are in progress. At most one policy
/// may own a given host.
pub trait HostCache: Send + Sync {
    fn find_id(&self, host: &str) -> Option<ResourceId>;

    /// Claims `host` for `id`, unless another policy already owns it.
    fn set(&self, host: &str, id: &ResourceId) -> Registration;

    /// Removes every host owned by `id` along with its published pipeline.
    fn delete(&self, id: &ResourceId);

    fn delete_host(&self, host: &str);

    /// Lists the hosts owned by `id`.
    fn find_hosts(&self, id: &ResourceId) -> Vec<String>;

    fn list(&self) -> Vec<(String, ResourceId)>;

    /// Replaces the pipeline for `id`. Concurrent lookups observe either the previous pipeline or
    /// the new one.
    fn publish(&self, id: &ResourceId, pipeline: Arc<AuthPipeline>);
}
