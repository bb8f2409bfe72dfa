use crate::k8s::handlers::EventKind;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use k8s_openapi::api::core::v1::Service;
use kube::ResourceExt;
use log::{debug, info};
use std::sync::Arc;

/// Handler that logs catalog membership changes.
pub fn log_changes(
) -> impl Fn(EventKind, Arc<Service>) -> BoxFuture<'static, Result<(), anyhow::Error>>
       + Send
       + Sync
       + 'static {
    |kind, svc| {
        let name = svc.name_any();
        let namespace = svc.namespace().unwrap_or_default();
        match kind {
            EventKind::Added => info!(
                "New Service '{}' added to the catalog in the {} namespace",
                name, namespace
            ),
            EventKind::Updated => debug!(
                "Service '{}' in the {} namespace updated to resource version {}",
                name,
                namespace,
                svc.resource_version().unwrap_or_default()
            ),
            EventKind::Deleted => info!(
                "Service '{}' deleted from the {} namespace",
                name, namespace
            ),
        }
        async { Ok::<(), anyhow::Error>(()) }.boxed()
    }
}
