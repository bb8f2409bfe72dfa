pub mod logging;

use crate::k8s::backoff;
use crate::k8s::connector;
use crate::k8s::handlers::Handlers;
use crate::k8s::source::KubeSource;
use crate::k8s::watcher::{self, Watcher};
use anyhow::anyhow;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Service as KubeService;
use log::{error, info};
use pingora::server::ShutdownWatch;
use pingora::services::background::BackgroundService;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub kubeconfig: Option<PathBuf>,
    pub resync_interval_secs: u64,
    pub watch_timeout_secs: u32,
    pub handler_grace_ms: u64,
    pub backoff: backoff::Config,
}

impl Config {
    pub fn watcher(&self) -> watcher::Config {
        watcher::Config {
            resync_interval: Duration::from_secs(self.resync_interval_secs),
            handler_grace: Duration::from_millis(self.handler_grace_ms),
            backoff: self.backoff.clone(),
        }
    }
}

/// Background service keeping a catalog of the cluster's Services.
pub struct Service {
    config: Config,
    handlers: Handlers<KubeService>,
    failure: mpsc::Sender<anyhow::Error>,
}

impl Service {
    pub fn new(
        config: Config,
        handlers: Handlers<KubeService>,
        failure_bus: mpsc::Sender<anyhow::Error>,
    ) -> Self {
        Self {
            config,
            handlers,
            failure: failure_bus,
        }
    }

    pub async fn run(&self, shutdown: ShutdownWatch) -> Result<(), anyhow::Error> {
        let client = connector::connect(self.config.kubeconfig.as_deref()).await?;
        info!(
            "Watching Services in {}",
            self.config.namespace.as_deref().unwrap_or("all namespaces")
        );

        let source = KubeSource::<KubeService>::new(
            client,
            self.config.namespace.as_deref(),
            self.config.watch_timeout_secs,
        );
        let watcher = Watcher::new(source, self.handlers.clone(), self.config.watcher());
        watcher
            .run(shutdown)
            .await
            .map_err(|e| anyhow!("Service watcher failed: {}", e))
    }
}

#[async_trait]
impl BackgroundService for Service {
    async fn start(&self, shutdown: ShutdownWatch) {
        info!("Starting Kubernetes Service catalog");

        if let Err(e) = self.run(shutdown).await {
            if let Err(e) = self.failure.clone().send(e).await {
                error!("Error sending error result failure channel: {}", e);
            }
            return;
        }

        info!("Stopped Kubernetes Service catalog");
    }
}
