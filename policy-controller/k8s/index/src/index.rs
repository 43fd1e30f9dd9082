use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use authpolicy_controller_core::{
    AuthPipeline, AuthRequest, Decision, Denial, DenialKind, HostCache, Registration, ResourceId,
};
use parking_lot::RwLock;
use std::sync::Arc;

/// A shared handle to the host index.
#[derive(Clone, Debug, Default)]
pub struct Index(Arc<RwLock<Inner>>);

#[derive(Debug, Default)]
pub(crate) struct Inner {
    hosts: HashMap<String, ResourceId>,
    by_id: HashMap<ResourceId, HashSet<String>>,
    pipelines: HashMap<ResourceId, Arc<AuthPipeline>>,
}

// === impl Index ===

impl Index {
    /// Finds the pipeline for a request host.
    ///
    /// Exact matches take precedence over wildcard hosts; among wildcards the most specific
    /// (`*.api.example.com` before `*.example.com`) wins.
    pub fn lookup(&self, host: &str) -> Option<(ResourceId, Arc<AuthPipeline>)> {
        let inner = self.0.read();
        let id = inner.resolve(host)?;
        let pipeline = inner.pipelines.get(id)?.clone();
        Some((id.clone(), pipeline))
    }

    /// Evaluates a request against the pipeline published for its host.
    pub async fn evaluate(&self, request: AuthRequest) -> Decision {
        let Some((id, pipeline)) = self.lookup(&request.host) else {
            tracing::debug!(host = %request.host, "No policy for host");
            return Decision::Deny(Denial {
                kind: DenialKind::NotFound,
                evaluator: None,
                reason: format!("no policy for host {}", request.host),
            });
        };
        tracing::trace!(host = %request.host, policy = %id, "Evaluating request");
        pipeline.evaluate(request).await
    }

    pub(crate) fn read(&self) -> parking_lot::RwLockReadGuard<'_, Inner> {
        self.0.read()
    }
}

impl HostCache for Index {
    fn find_id(&self, host: &str) -> Option<ResourceId> {
        self.0.read().hosts.get(host).cloned()
    }

    fn set(&self, host: &str, id: &ResourceId) -> Registration {
        let mut inner = self.0.write();
        match inner.hosts.get(host) {
            Some(owner) if owner == id => return Registration::Unchanged,
            Some(owner) => {
                return Registration::Collision {
                    owner: owner.clone(),
                }
            }
            None => {}
        }
        inner.hosts.insert(host.to_string(), id.clone());
        inner
            .by_id
            .entry(id.clone())
            .or_default()
            .insert(host.to_string());
        Registration::Linked
    }

    fn delete(&self, id: &ResourceId) {
        let mut inner = self.0.write();
        if let Some(hosts) = inner.by_id.remove(id) {
            for host in hosts {
                inner.hosts.remove(&host);
            }
        }
        inner.pipelines.remove(id);
    }

    fn delete_host(&self, host: &str) {
        let mut inner = self.0.write();
        let Some(id) = inner.hosts.remove(host) else {
            return;
        };
        if let Some(hosts) = inner.by_id.get_mut(&id) {
            hosts.remove(host);
            if hosts.is_empty() {
                inner.by_id.remove(&id);
            }
        }
    }

    fn find_hosts(&self, id: &ResourceId) -> Vec<String> {
        let inner = self.0.read();
        let mut hosts = inner
            .by_id
            .get(id)
            .map(|hosts| hosts.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        hosts.sort();
        hosts
    }

    fn list(&self) -> Vec<(String, ResourceId)> {
        let inner = self.0.read();
        let mut entries = inner
            .hosts
            .iter()
            .map(|(host, id)| (host.clone(), id.clone()))
            .collect::<Vec<_>>();
        entries.sort();
        entries
    }

    fn publish(&self, id: &ResourceId, pipeline: Arc<AuthPipeline>) {
        self.0.write().pipelines.insert(id.clone(), pipeline);
    }
}

// === impl Inner ===

impl Inner {
    fn resolve(&self, host: &str) -> Option<&ResourceId> {
        if let Some(id) = self.hosts.get(host) {
            return Some(id);
        }

        let mut rest = host;
        while let Some((_, parent)) = rest.split_once('.') {
            if let Some(id) = self.hosts.get(&format!("*.{parent}")) {
                return Some(id);
            }
            rest = parent;
        }
        None
    }

    pub(crate) fn host_counts(&self) -> HashMap<&str, usize> {
        let mut counts = HashMap::new();
        for id in self.hosts.values() {
            *counts.entry(id.namespace.as_str()).or_default() += 1;
        }
        counts
    }

    pub(crate) fn pipeline_counts(&self) -> HashMap<&str, usize> {
        let mut counts = HashMap::new();
        for id in self.pipelines.keys() {
            *counts.entry(id.namespace.as_str()).or_default() += 1;
        }
        counts
    }
}
