use crate::{
    driver::{Backoff, Driver},
    evaluators::{self, HttpDiscovery, KubeReviewer},
    index::{self, Index},
    k8s,
    reconcile::{ReconcileMetrics, Reconciler},
    status,
    store::KubeStore,
    translate::Translator,
};
use anyhow::{bail, Result};
use clap::Parser;
use futures::prelude::*;
use kube::runtime::watcher;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tokio::{sync::mpsc, time::Duration};
use tracing::{info_span, Instrument};

// The maximum number of status patches to buffer before updates are dropped. Dropped updates are
// recomputed on the next reconcile of the policy.
const STATUS_UPDATE_QUEUE_SIZE: usize = 10_000;

#[derive(Debug, Parser)]
#[clap(name = "authpolicy", about = "An authorization policy controller")]
pub struct Args {
    #[clap(
        long,
        default_value = "authpolicy=info,warn",
        env = "AUTHPOLICY_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Restricts the watches to a single namespace.
    ///
    /// All namespaces are watched by default.
    #[clap(long)]
    watch_namespace: Option<String>,

    /// The deadline for a single request evaluation.
    #[clap(long, default_value = "5000")]
    evaluation_timeout_ms: u64,

    /// How long issuer discovery documents and key sets are cached.
    #[clap(long, default_value = "3600")]
    discovery_ttl_secs: u64,

    /// The timeout for each outbound call made by evaluators.
    #[clap(long, default_value = "5000")]
    http_timeout_ms: u64,

    #[clap(long, default_value = "5000")]
    status_patch_timeout_ms: u64,

    /// The maximum delay between retries of a failing reconcile.
    #[clap(long, default_value = "300")]
    reconcile_backoff_max_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            admin,
            watch_namespace,
            evaluation_timeout_ms,
            discovery_ttl_secs,
            http_timeout_ms,
            status_patch_timeout_ms,
            reconcile_backoff_max_secs,
        } = self;

        let hosts = Index::default();

        let mut prom = <Registry>::default();
        index::metrics::register(prom.sub_registry_with_prefix("index"), hosts.clone());
        let status_metrics =
            status::ControllerMetrics::register(prom.sub_registry_with_prefix("status"));
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("authconfig"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;

        let http_timeout = Duration::from_millis(http_timeout_ms);
        let http = evaluators::http_client(http_timeout)?;
        let discovery = Arc::new(HttpDiscovery::new(
            http.clone(),
            Duration::from_secs(discovery_ttl_secs),
        ));
        let reviewer = Arc::new(KubeReviewer::new(runtime.client()));
        let translator = Translator::new(
            discovery,
            http,
            reviewer,
            Duration::from_millis(evaluation_timeout_ms),
            http_timeout,
        );

        let (updates_tx, updates_rx) = mpsc::channel(STATUS_UPDATE_QUEUE_SIZE);
        let store = Arc::new(KubeStore::new(runtime.client()));
        let reconciler = Reconciler::new(
            store.clone(),
            store,
            Arc::new(hosts),
            translator,
            updates_tx,
            reconcile_metrics,
        );
        let driver = Driver::new(
            reconciler,
            Backoff::new(Duration::from_secs(reconcile_backoff_max_secs)),
        );

        // Spawn resource watches.

        let (configs, secrets) = match watch_namespace.as_deref() {
            Some(ns) => {
                tracing::info!(namespace = %ns, "Watching a single namespace");
                (
                    runtime
                        .watch_namespaced::<k8s::AuthConfig>(ns.to_string(), watcher::Config::default())
                        .boxed(),
                    runtime
                        .watch_namespaced::<k8s::Secret>(ns.to_string(), watcher::Config::default())
                        .boxed(),
                )
            }
            None => (
                runtime
                    .watch_all::<k8s::AuthConfig>(watcher::Config::default())
                    .boxed(),
                runtime
                    .watch_all::<k8s::Secret>(watcher::Config::default())
                    .boxed(),
            ),
        };
        tokio::spawn(
            driver
                .clone()
                .watch_policies(configs)
                .instrument(info_span!("authconfigs")),
        );
        tokio::spawn(
            driver
                .watch_secrets(secrets)
                .instrument(info_span!("secrets")),
        );

        let status_controller = status::Controller::new(
            runtime.client(),
            updates_rx,
            Duration::from_millis(status_patch_timeout_ms),
            status_metrics,
        );
        tokio::spawn(
            status_controller
                .run()
                .instrument(info_span!("status_controller")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
