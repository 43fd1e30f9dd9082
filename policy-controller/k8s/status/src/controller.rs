use authpolicy_controller_core::{ResourceId, POLICY_CONTROLLER_NAME};
use authpolicy_controller_k8s_api::{self as k8s, AuthConfig};
use prometheus_client::{metrics::counter::Counter, registry::Registry};
use tokio::{
    sync::mpsc,
    time::{self, Duration},
};

#[derive(Debug, PartialEq)]
pub struct Update {
    pub id: ResourceId,
    pub patch: k8s::Patch<serde_json::Value>,
}

pub struct Controller {
    client: k8s::Client,
    updates: mpsc::Receiver<Update>,
    patch_timeout: Duration,
    metrics: ControllerMetrics,
}

#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    patch_succeeded: Counter,
    patch_failed: Counter,
    patch_timeout: Counter,
}

// === impl Controller ===

impl Controller {
    pub fn new(
        client: k8s::Client,
        updates: mpsc::Receiver<Update>,
        patch_timeout: Duration,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            updates,
            patch_timeout,
            metrics,
        }
    }

    /// Applies queued patches until every sender is dropped.
    pub async fn run(mut self) {
        let params = k8s::PatchParams::apply(POLICY_CONTROLLER_NAME);
        while let Some(Update { id, patch }) = self.updates.recv().await {
            let api = k8s::Api::<AuthConfig>::namespaced(self.client.clone(), &id.namespace);
            match time::timeout(
                self.patch_timeout,
                api.patch_status(&id.name, &params, &patch),
            )
            .await
            {
                Ok(Ok(_)) => {
                    tracing::debug!(namespace = %id.namespace, name = %id.name, "Patched status");
                    self.metrics.patch_succeeded.inc();
                }
                Ok(Err(error)) => {
                    tracing::error!(namespace = %id.namespace, name = %id.name, %error, "Failed to patch status");
                    self.metrics.patch_failed.inc();
                }
                Err(_) => {
                    tracing::error!(
                        namespace = %id.namespace,
                        name = %id.name,
                        timeout = ?self.patch_timeout,
                        "Timed out patching status"
                    );
                    self.metrics.patch_timeout.inc();
                }
            }
        }
    }
}

// === impl ControllerMetrics ===

impl ControllerMetrics {
    pub fn register(prom: &mut Registry) -> Self {
        let patch_succeeded = Counter::default();
        prom.register(
            "patch_succeeded",
            "Count of successful status patches",
            patch_succeeded.clone(),
        );

        let patch_failed = Counter::default();
        prom.register(
            "patch_failed",
            "Count of failed status patches",
            patch_failed.clone(),
        );

        let patch_timeout = Counter::default();
        prom.register(
            "patch_timeout",
            "Count of status patches that timed out",
            patch_timeout.clone(),
        );

        Self {
            patch_succeeded,
            patch_failed,
            patch_timeout,
        }
    }
}
