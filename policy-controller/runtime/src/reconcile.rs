use crate::{
    core::{HostCache, Registration, ResourceId},
    k8s,
    status,
    store::{AuthConfigStore, SecretAccessor, SecretError},
    translate::{self, Secrets, Translator},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Converges the host cache and a policy's status with its declared state.
pub struct Reconciler {
    store: Arc<dyn AuthConfigStore>,
    secrets: Arc<dyn SecretAccessor>,
    cache: Arc<dyn HostCache>,
    translator: Translator,
    status: mpsc::Sender<status::Update>,
    deps: Mutex<Dependencies>,
    metrics: ReconcileMetrics,
}

/// Errors that leave the cache at its last known state and warrant a retry.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read policy: {0}")]
    Store(anyhow::Error),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error("dependency unavailable: {0}")]
    Unavailable(anyhow::Error),
}

/// Policies that should be reconciled again as a consequence of a reconcile.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Requeue(pub Vec<ResourceId>);

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    reconciles: Family<ResultLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: &'static str,
}

#[derive(Debug, Default)]
struct Dependencies {
    /// Policies referencing each secret.
    secrets: HashMap<ResourceId, HashSet<ResourceId>>,

    /// Policies that declare each host but could not claim it.
    contenders: HashMap<String, HashSet<ResourceId>>,
}

// === impl Reconciler ===

impl Reconciler {
    pub fn new(
        store: Arc<dyn AuthConfigStore>,
        secrets: Arc<dyn SecretAccessor>,
        cache: Arc<dyn HostCache>,
        translator: Translator,
        status: mpsc::Sender<status::Update>,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            store,
            secrets,
            cache,
            translator,
            status,
            deps: Mutex::default(),
            metrics,
        }
    }

    /// Reconciles the policy identified by `id`.
    ///
    /// Invalid specs and host collisions are reported through the policy's status and are not
    /// errors. An error means the policy could not be converged and the cache was left unchanged.
    pub async fn reconcile(&self, id: &ResourceId) -> Result<Requeue, Error> {
        let config = match self.store.get(id).await {
            Ok(config) => config,
            Err(error) => {
                self.metrics.inc("error");
                return Err(Error::Store(error));
            }
        };
        let Some(config) = config else {
            tracing::debug!(policy = %id, "Policy not found; removing");
            self.metrics.inc("deleted");
            return Ok(self.remove(id));
        };

        let res = self.apply(id, &config).await;
        self.metrics.inc(if res.is_ok() { "ok" } else { "error" });
        res
    }

    /// Lists the policies that reference the given secret.
    pub fn secret_dependents(&self, secret: &ResourceId) -> Vec<ResourceId> {
        let deps = self.deps.lock();
        let mut ids = deps
            .secrets
            .get(secret)
            .map(|ids| ids.iter().cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    async fn apply(&self, id: &ResourceId, config: &k8s::AuthConfig) -> Result<Requeue, Error> {
        let spec = &config.spec;
        let generation = config.metadata.generation;

        // Dependencies are recorded before they are resolved so that a missing secret triggers
        // a reconcile once it is created.
        self.track_secrets(id, spec.secret_refs());
        let secrets = self.resolve_secrets(id, spec).await?;

        let pipeline = match self.translator.translate(spec, &secrets).await {
            Ok(pipeline) => pipeline,
            Err(translate::Error::Invalid(error)) => {
                tracing::info!(policy = %id, %error, "Invalid policy");
                let hosts = self.cache.find_hosts(id);
                self.update_status(id, config, status::invalid_spec(generation, hosts, error));
                return Ok(Requeue::default());
            }
            Err(translate::Error::Unavailable(error)) => return Err(Error::Unavailable(error)),
        };
        self.cache.publish(id, Arc::new(pipeline));

        let declared = spec.hosts.iter().map(String::as_str).collect::<HashSet<_>>();
        let mut released = Vec::new();
        for host in self.cache.find_hosts(id) {
            if !declared.contains(host.as_str()) {
                tracing::debug!(policy = %id, %host, "Unlinking host");
                self.cache.delete_host(&host);
                released.push(host);
            }
        }

        let mut linked = Vec::with_capacity(spec.hosts.len());
        let mut collisions = Vec::new();
        for host in &spec.hosts {
            match self.cache.set(host, id) {
                Registration::Linked => {
                    tracing::debug!(policy = %id, %host, "Linked host");
                    linked.push(host.clone());
                }
                Registration::Unchanged => linked.push(host.clone()),
                Registration::Collision { owner } => {
                    tracing::info!(policy = %id, %host, %owner, "Host is claimed by another policy");
                    collisions.push((host.clone(), owner));
                }
            }
        }

        let requeue = self.track_contenders(id, &collisions, &released);

        // An owner removed after the claims above but before this policy was recorded as a
        // contender found no one to requeue, so the claims are retried once.
        collisions.retain_mut(|(host, owner)| match self.cache.set(host, id) {
            Registration::Collision { owner: current } => {
                *owner = current;
                true
            }
            Registration::Linked | Registration::Unchanged => {
                tracing::debug!(policy = %id, %host, "Linked released host");
                self.untrack_contender(id, host);
                linked.push(host.clone());
                false
            }
        });
        linked.sort();
        linked.dedup();

        let desired = if collisions.is_empty() {
            status::reconciled(generation, linked)
        } else {
            status::hosts_collision(generation, linked, &collisions)
        };
        self.update_status(id, config, desired);

        Ok(requeue)
    }

    fn remove(&self, id: &ResourceId) -> Requeue {
        let released = self.cache.find_hosts(id);
        self.cache.delete(id);
        self.track_secrets(id, std::iter::empty());
        self.track_contenders(id, &[], &released)
    }

    async fn resolve_secrets(
        &self,
        id: &ResourceId,
        spec: &k8s::AuthConfigSpec,
    ) -> Result<Secrets, SecretError> {
        let mut secrets = Secrets::default();
        for (name, key) in translate::secret_keys(spec) {
            let value = self.secrets.get_secret(&id.namespace, name, key).await?;
            secrets.insert(name, key, value);
        }
        Ok(secrets)
    }

    fn track_secrets<'s>(&self, id: &ResourceId, refs: impl Iterator<Item = &'s str>) {
        let refs = refs
            .map(|name| ResourceId::new(&id.namespace, name))
            .collect::<HashSet<_>>();
        let mut deps = self.deps.lock();
        deps.secrets.retain(|secret, dependents| {
            if !refs.contains(secret) {
                dependents.remove(id);
            }
            !dependents.is_empty()
        });
        for secret in refs {
            deps.secrets.entry(secret).or_default().insert(id.clone());
        }
    }

    /// Records the hosts `id` failed to claim and returns the policies waiting on hosts it
    /// released.
    fn track_contenders(
        &self,
        id: &ResourceId,
        collisions: &[(String, ResourceId)],
        released: &[String],
    ) -> Requeue {
        let mut deps = self.deps.lock();
        deps.contenders.retain(|_, ids| {
            ids.remove(id);
            !ids.is_empty()
        });
        for (host, _) in collisions {
            deps.contenders
                .entry(host.clone())
                .or_default()
                .insert(id.clone());
        }

        let mut requeue = released
            .iter()
            .filter_map(|host| deps.contenders.get(host))
            .flatten()
            .cloned()
            .collect::<Vec<_>>();
        requeue.sort();
        requeue.dedup();
        Requeue(requeue)
    }

    fn untrack_contender(&self, id: &ResourceId, host: &str) {
        let mut deps = self.deps.lock();
        if let Some(ids) = deps.contenders.get_mut(host) {
            ids.remove(id);
            if ids.is_empty() {
                deps.contenders.remove(host);
            }
        }
    }

    fn update_status(
        &self,
        id: &ResourceId,
        config: &k8s::AuthConfig,
        desired: k8s::AuthConfigStatus,
    ) {
        let Some(status) = status::diff(config.status.as_ref(), desired) else {
            tracing::trace!(policy = %id, "Status unchanged");
            return;
        };
        tracing::debug!(policy = %id, ready = status.ready, "Updating status");
        let update = status::Update {
            id: id.clone(),
            patch: status::make_patch(&status),
        };
        if let Err(error) = self.status.try_send(update) {
            tracing::error!(policy = %id, %error, "Failed to queue status update");
        }
    }
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of policy reconciles by result",
            reconciles.clone(),
        );
        Self { reconciles }
    }

    fn inc(&self, result: &'static str) {
        self.reconciles.get_or_create(&ResultLabels { result }).inc();
    }
}
