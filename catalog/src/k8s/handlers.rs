use crate::k8s::cache::{Change, ObjectKey};
use futures_util::future::BoxFuture;
use log::error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [EventKind::Added, EventKind::Updated, EventKind::Deleted];
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Added => write!(f, "add"),
            EventKind::Updated => write!(f, "update"),
            EventKind::Deleted => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("handler '{name}' failed on {kind} of {key}: {cause}")]
    Failed {
        name: String,
        kind: EventKind,
        key: ObjectKey,
        cause: anyhow::Error,
    },

    #[error("handler '{name}' panicked on {kind} of {key}: {reason}")]
    Panicked {
        name: String,
        kind: EventKind,
        key: ObjectKey,
        reason: String,
    },

    #[error("handler '{name}' exceeded its {grace:?} grace period on {kind} of {key}")]
    TimedOut {
        name: String,
        kind: EventKind,
        key: ObjectKey,
        grace: Duration,
    },
}

pub type Handler<K> =
    Arc<dyn Fn(EventKind, Arc<K>) -> BoxFuture<'static, Result<(), anyhow::Error>> + Send + Sync>;

struct Subscription<K> {
    name: String,
    kinds: Vec<EventKind>,
    handler: Handler<K>,
}

impl<K> Clone for Subscription<K> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            kinds: self.kinds.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Ordered list of handlers, each subscribed to a set of event kinds.
pub struct Handlers<K> {
    subscriptions: Vec<Subscription<K>>,
}

impl<K> Clone for Handlers<K> {
    fn clone(&self) -> Self {
        Self {
            subscriptions: self.subscriptions.clone(),
        }
    }
}

impl<K> Default for Handlers<K> {
    fn default() -> Self {
        Self {
            subscriptions: Vec::new(),
        }
    }
}

impl<K: Send + Sync + 'static> Handlers<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&mut self, name: &str, kinds: &[EventKind], handler: F) -> &mut Self
    where
        F: Fn(EventKind, Arc<K>) -> BoxFuture<'static, Result<(), anyhow::Error>>
            + Send
            + Sync
            + 'static,
    {
        self.subscriptions.push(Subscription {
            name: name.to_string(),
            kinds: kinds.to_vec(),
            handler: Arc::new(handler),
        });
        self
    }

    /// Runs every handler subscribed to the change's kind, in registration
    /// order. Each invocation runs on its own task bounded by `grace`;
    /// errors, panics and timeouts are logged and returned but never stop
    /// the remaining handlers.
    pub async fn dispatch(&self, change: &Change<K>, grace: Duration) -> Vec<Error> {
        let mut failures = Vec::new();
        for sub in self
            .subscriptions
            .iter()
            .filter(|s| s.kinds.contains(&change.kind))
        {
            let handler = sub.handler.clone();
            let (kind, object) = (change.kind, change.object.clone());
            let mut invocation = tokio::spawn(async move { handler(kind, object).await });

            let failure = match tokio::time::timeout(grace, &mut invocation).await {
                Ok(Ok(Ok(()))) => continue,
                Ok(Ok(Err(e))) => Error::Failed {
                    name: sub.name.clone(),
                    kind,
                    key: change.key.clone(),
                    cause: e,
                },
                Ok(Err(e)) => Error::Panicked {
                    name: sub.name.clone(),
                    kind,
                    key: change.key.clone(),
                    reason: e.to_string(),
                },
                Err(_) => {
                    invocation.abort();
                    Error::TimedOut {
                        name: sub.name.clone(),
                        kind,
                        key: change.key.clone(),
                        grace,
                    }
                }
            };
            error!("Error running watch handler: {}", failure);
            failures.push(failure);
        }
        failures
    }
}
