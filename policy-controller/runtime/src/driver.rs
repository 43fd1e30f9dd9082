//! Drives reconciles from watch events.
//!
//! At most one reconcile runs per policy at a time; distinct policies reconcile concurrently. An
//! event for a policy that is being reconciled marks it dirty so that it runs once more when the
//! current reconcile completes. Failed reconciles are retried with exponential backoff, and an
//! event for a policy waiting on a retry runs it immediately.

use crate::{
    core::ResourceId,
    k8s::{self, ResourceExt},
    reconcile::{Reconciler, Requeue},
};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use futures::prelude::*;
use kube::runtime::watcher;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::{
    task::AbortHandle,
    time::{self, Duration},
};
use tracing::{info_span, Instrument};

#[async_trait::async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, id: &ResourceId) -> anyhow::Result<Requeue>;

    fn secret_dependents(&self, secret: &ResourceId) -> Vec<ResourceId>;
}

pub struct Driver<R> {
    inner: Arc<Inner<R>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
}

struct Inner<R> {
    reconciler: R,
    backoff: Backoff,
    keys: Mutex<HashMap<ResourceId, KeyState>>,
}

#[derive(Debug, Default)]
struct KeyState {
    running: bool,
    dirty: bool,
    failures: u32,
    retry: Option<AbortHandle>,
}

// === impl Driver ===

impl<R: Reconcile> Driver<R> {
    pub fn new(reconciler: R, backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                reconciler,
                backoff,
                keys: Mutex::default(),
            }),
        }
    }

    /// Schedules a reconcile of `id`.
    pub fn enqueue(&self, id: ResourceId) {
        self.start(id, false)
    }

    /// Reconciles every policy observed on the watch. Policies that disappear while the watch
    /// restarts are reconciled as deletions.
    pub async fn watch_policies(self, events: impl Stream<Item = watcher::Event<k8s::AuthConfig>>) {
        tokio::pin!(events);
        let mut known = HashSet::new();
        let mut seen = HashSet::new();
        while let Some(event) = events.next().await {
            match event {
                watcher::Event::Init => seen.clear(),
                watcher::Event::InitApply(config) => {
                    let id = resource_id(&config);
                    seen.insert(id.clone());
                    self.enqueue(id);
                }
                watcher::Event::InitDone => {
                    for id in known.difference(&seen) {
                        tracing::debug!(policy = %id, "Policy removed while resyncing");
                        self.enqueue(id.clone());
                    }
                    known = std::mem::take(&mut seen);
                }
                watcher::Event::Apply(config) => {
                    let id = resource_id(&config);
                    known.insert(id.clone());
                    self.enqueue(id);
                }
                watcher::Event::Delete(config) => {
                    let id = resource_id(&config);
                    known.remove(&id);
                    self.enqueue(id);
                }
            }
        }
    }

    /// Reconciles the policies that depend on each changed secret.
    pub async fn watch_secrets(self, events: impl Stream<Item = watcher::Event<k8s::Secret>>) {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            let secret = match event {
                watcher::Event::Apply(secret)
                | watcher::Event::InitApply(secret)
                | watcher::Event::Delete(secret) => resource_id(&secret),
                watcher::Event::Init | watcher::Event::InitDone => continue,
            };
            for id in self.inner.reconciler.secret_dependents(&secret) {
                tracing::debug!(%secret, policy = %id, "Secret changed");
                self.enqueue(id);
            }
        }
    }

    fn start(&self, id: ResourceId, from_retry: bool) {
        let mut keys = self.inner.keys.lock();
        let state = keys.entry(id.clone()).or_default();
        if from_retry {
            state.retry = None;
        }
        if state.running {
            state.dirty = true;
            return;
        }
        if let Some(retry) = state.retry.take() {
            retry.abort();
        }
        state.running = true;
        drop(keys);

        let span = info_span!("reconcile", policy = %id);
        tokio::spawn(self.clone().process(id).instrument(span));
    }

    async fn process(self, id: ResourceId) {
        loop {
            let failed = match self.inner.reconciler.reconcile(&id).await {
                Ok(Requeue(ids)) => {
                    for other in ids {
                        tracing::debug!(policy = %other, "Requeueing");
                        self.enqueue(other);
                    }
                    false
                }
                Err(error) => {
                    tracing::warn!(%error, "Reconcile failed");
                    true
                }
            };

            let mut keys = self.inner.keys.lock();
            let Some(state) = keys.get_mut(&id) else {
                return;
            };
            if state.dirty {
                state.dirty = false;
                continue;
            }
            state.running = false;

            if !failed {
                keys.remove(&id);
                return;
            }

            state.failures += 1;
            let delay = self.inner.backoff.delay(state.failures);
            tracing::debug!(?delay, failures = state.failures, "Scheduling retry");
            let driver = self.clone();
            let retry = id.clone();
            let task = tokio::spawn(async move {
                time::sleep(delay).await;
                driver.start(retry, true);
            });
            state.retry = Some(task.abort_handle());
            return;
        }
    }
}

impl<R> Clone for Driver<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

#[async_trait::async_trait]
impl Reconcile for Reconciler {
    async fn reconcile(&self, id: &ResourceId) -> anyhow::Result<Requeue> {
        Ok(Reconciler::reconcile(self, id).await?)
    }

    fn secret_dependents(&self, secret: &ResourceId) -> Vec<ResourceId> {
        Reconciler::secret_dependents(self, secret)
    }
}

// === impl Backoff ===

impl Backoff {
    pub const MIN: Duration = Duration::from_secs(1);

    pub fn new(max: Duration) -> Self {
        Self {
            min: Self::MIN,
            max: max.max(Self::MIN),
        }
    }

    /// The delay before the retry following `failures` consecutive failures.
    fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.min.saturating_mul(factor).min(self.max)
    }
}

fn resource_id<K: ResourceExt>(obj: &K) -> ResourceId {
    ResourceId::new(obj.namespace().unwrap_or_default(), obj.name_unchecked())
}
