use crate::k8s::Object;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use k8s_openapi::NamespaceResourceScope;
use kube::api::{ListParams, WatchEvent, WatchParams};
use kube::{Api, Resource};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes request failed: {0}")]
    Request(#[from] kube::Error),

    #[error("watch bookmark {0} is no longer available")]
    Expired(String),

    #[error("Kubernetes reported a watch error: {0}")]
    Remote(String),

    #[error("watch stream closed")]
    Closed,
}

/// A full listing and the resource version it was taken at.
#[derive(Debug)]
pub struct Listing<K> {
    pub items: Vec<K>,
    pub resource_version: String,
}

#[derive(Debug)]
pub enum Notification<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    Bookmark(String),
}

pub type Notifications<K> = BoxStream<'static, Result<Notification<K>, Error>>;

/// List and watch access to one resource class.
#[async_trait]
pub trait Source<K: Object>: Send + Sync {
    async fn list(&self) -> Result<Listing<K>, Error>;

    /// Opens a change stream starting after `bookmark`. Dropping the returned
    /// stream closes the underlying connection.
    async fn watch(&self, bookmark: &str) -> Result<Notifications<K>, Error>;
}

/// The API server rejects watch timeouts of 295 seconds or more.
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

pub struct KubeSource<K> {
    api: Api<K>,
    watch_timeout_secs: u32,
}

impl<K> KubeSource<K>
where
    K: Object + Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    pub fn new(client: kube::Client, namespace: Option<&str>, watch_timeout_secs: u32) -> Self {
        let api = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        };
        Self {
            api,
            watch_timeout_secs,
        }
    }
}

#[async_trait]
impl<K: Object> Source<K> for KubeSource<K> {
    async fn list(&self) -> Result<Listing<K>, Error> {
        let list = self.api.list(&ListParams::default()).await?;
        Ok(Listing {
            resource_version: list.metadata.resource_version.unwrap_or_default(),
            items: list.items,
        })
    }

    async fn watch(&self, bookmark: &str) -> Result<Notifications<K>, Error> {
        let params =
            WatchParams::default().timeout(self.watch_timeout_secs.min(MAX_WATCH_TIMEOUT_SECS));
        let bookmark = bookmark.to_string();
        let stream = self.api.watch(&params, &bookmark).await?;
        Ok(stream
            .map_err(Error::from)
            .and_then(move |event| futures_util::future::ready(notification(event, &bookmark)))
            .boxed())
    }
}

/// Maps a raw watch event. An HTTP 410 means the bookmark the stream was
/// opened from has been compacted away.
fn notification<K>(event: WatchEvent<K>, bookmark: &str) -> Result<Notification<K>, Error> {
    match event {
        WatchEvent::Added(o) => Ok(Notification::Added(o)),
        WatchEvent::Modified(o) => Ok(Notification::Modified(o)),
        WatchEvent::Deleted(o) => Ok(Notification::Deleted(o)),
        WatchEvent::Bookmark(b) => Ok(Notification::Bookmark(b.metadata.resource_version)),
        WatchEvent::Error(e) if e.code == 410 => Err(Error::Expired(bookmark.to_string())),
        WatchEvent::Error(e) => Err(Error::Remote(e.message)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::Service;

    fn event(json: &str) -> WatchEvent<Service> {
        serde_json::from_str(json).unwrap()
    }

    fn service_event(kind: &str) -> WatchEvent<Service> {
        event(&format!(
            r#"{{"type":"{}","object":{{"apiVersion":"v1","kind":"Service","metadata":{{"name":"svc-a","namespace":"default","resourceVersion":"7"}}}}}}"#,
            kind
        ))
    }

    #[test]
    fn object_events_keep_their_payload() {
        match notification(service_event("ADDED"), "5").unwrap() {
            Notification::Added(svc) => assert_eq!(svc.metadata.name.as_deref(), Some("svc-a")),
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(matches!(
            notification(service_event("MODIFIED"), "5").unwrap(),
            Notification::Modified(_)
        ));
        assert!(matches!(
            notification(service_event("DELETED"), "5").unwrap(),
            Notification::Deleted(_)
        ));
    }

    #[test]
    fn bookmark_carries_its_resource_version() {
        let bookmark = event(
            r#"{"type":"BOOKMARK","object":{"apiVersion":"v1","kind":"Service","metadata":{"resourceVersion":"12"}}}"#,
        );
        match notification(bookmark, "5").unwrap() {
            Notification::Bookmark(version) => assert_eq!(version, "12"),
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[test]
    fn gone_is_an_expired_bookmark() {
        let gone = event(
            r#"{"type":"ERROR","object":{"status":"Failure","message":"too old resource version: 5 (9)","reason":"Expired","code":410}}"#,
        );
        match notification(gone, "5") {
            Err(Error::Expired(bookmark)) => assert_eq!(bookmark, "5"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn other_errors_are_remote_failures() {
        let failure = event(
            r#"{"type":"ERROR","object":{"status":"Failure","message":"internal error","reason":"InternalError","code":500}}"#,
        );
        match notification(failure, "5") {
            Err(Error::Remote(message)) => assert_eq!(message, "internal error"),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
