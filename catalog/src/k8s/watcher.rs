use crate::k8s::backoff::{self, Backoff};
use crate::k8s::cache::{Cache, Change, ObjectKey, Snapshot};
use crate::k8s::handlers::Handlers;
use crate::k8s::source::{self, Notification, Source};
use crate::k8s::Object;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use pingora::server::ShutdownWatch;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::select;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Error)]
pub enum Error {
    #[error("initial sync failed: {0}")]
    InitialSyncFailed(source::Error),

    #[error("watch stream disconnected: {0}")]
    StreamDisconnected(source::Error),

    #[error("gave up after {attempts} reconnect attempts, last error: {last}")]
    RetryCeilingExceeded { attempts: u32, last: Box<Error> },
}

#[derive(Clone, Debug)]
pub struct Config {
    pub resync_interval: Duration,
    pub handler_grace: Duration,
    pub backoff: backoff::Config,
}

/// One continuous connection to the change stream.
#[derive(Debug)]
pub struct WatchSession {
    /// Last resource version seen on this connection.
    pub bookmark: String,
    opened_at: Instant,
    delivered: bool,
}

impl WatchSession {
    fn new(bookmark: String) -> Self {
        Self {
            bookmark,
            opened_at: Instant::now(),
            delivered: false,
        }
    }

    fn advance<K: Object>(&mut self, obj: &K) {
        if let Some(version) = &obj.meta().resource_version {
            self.bookmark.clone_from(version);
        }
    }

    /// A session is healthy once it has delivered a notification or has
    /// stayed open for at least `settle`.
    fn healthy(&self, settle: Duration) -> bool {
        self.delivered || self.opened_at.elapsed() >= settle
    }
}

#[derive(Debug)]
enum State {
    Initializing,
    Streaming(WatchSession),
    Reconnecting(Error),
    Stopping,
    Failed(Error),
    Stopped,
}

/// Mirrors one resource class into a local cache and fans changes out to
/// the registered handlers. The cache is only touched from the task that
/// drives [`Watcher::run`]; readers get immutable snapshots.
pub struct Watcher<K, S> {
    source: S,
    handlers: Handlers<K>,
    config: Config,
    cache: Cache<K>,
    backoff: Backoff,
    snapshots: watch::Sender<Snapshot<K>>,
}

impl<K, S> Watcher<K, S>
where
    K: Object,
    S: Source<K>,
{
    pub fn new(source: S, handlers: Handlers<K>, config: Config) -> Self {
        let (snapshots, _) = watch::channel(Arc::new(HashMap::new()));
        Self {
            source,
            handlers,
            backoff: Backoff::new(&config.backoff),
            config,
            cache: Cache::new(),
            snapshots,
        }
    }

    /// Receiver for cache snapshots, republished after every batch of
    /// changes while at least one receiver is alive.
    pub fn snapshots(&self) -> watch::Receiver<Snapshot<K>> {
        self.snapshots.send_replace(self.cache.snapshot());
        self.snapshots.subscribe()
    }

    /// Runs until `shutdown` fires (`Ok`) or reconnecting gives up (`Err`).
    pub async fn run(mut self, mut shutdown: ShutdownWatch) -> Result<(), Error> {
        let mut state = State::Initializing;
        loop {
            debug!("Watcher entering state {:?}", state);
            state = match state {
                State::Initializing => self.initialize(&mut shutdown).await,
                State::Streaming(session) => self.stream(session, &mut shutdown).await,
                State::Reconnecting(cause) => self.reconnect(cause, &mut shutdown).await,
                State::Stopping => {
                    info!("Stopping watcher with {} cached objects", self.cache.len());
                    State::Stopped
                }
                State::Stopped => return Ok(()),
                State::Failed(e) => return Err(e),
            };
        }
    }

    async fn initialize(&mut self, shutdown: &mut ShutdownWatch) -> State {
        let listing = select! {
            biased;
            _ = cancelled(shutdown) => return State::Stopping,
            listing = self.source.list() => listing,
        };
        let listing = match listing {
            Ok(listing) => listing,
            Err(e) => return State::Reconnecting(Error::InitialSyncFailed(e)),
        };

        let items = listing.items.into_iter().filter_map(keyed).collect();
        let changes = self.cache.replace(items);
        info!(
            "Synced {} objects at resource version {} ({} changes)",
            self.cache.len(),
            listing.resource_version,
            changes.len()
        );
        if !self.deliver(changes, shutdown).await {
            return State::Stopping;
        }

        State::Streaming(WatchSession::new(listing.resource_version))
    }

    async fn stream(&mut self, mut session: WatchSession, shutdown: &mut ShutdownWatch) -> State {
        let opened = select! {
            biased;
            _ = cancelled(shutdown) => return State::Stopping,
            opened = self.source.watch(&session.bookmark) => opened,
        };
        let mut notifications = match opened {
            Ok(stream) => stream,
            Err(e) => return State::Reconnecting(Error::StreamDisconnected(e)),
        };
        session.opened_at = Instant::now();
        debug!("Watching for changes after resource version {}", session.bookmark);

        let resync = tokio::time::sleep(self.config.resync_interval);
        tokio::pin!(resync);

        loop {
            let notification = select! {
                biased;
                _ = cancelled(shutdown) => return State::Stopping,
                _ = &mut resync => {
                    info!("Resync interval elapsed at resource version {}, relisting", session.bookmark);
                    self.backoff.reset();
                    return State::Initializing;
                }
                notification = notifications.next() => notification,
            };

            if matches!(notification, Some(Ok(_))) && !session.delivered {
                session.delivered = true;
                self.backoff.reset();
            }

            let change = match notification {
                Some(Ok(Notification::Added(obj))) | Some(Ok(Notification::Modified(obj))) => {
                    session.advance(&obj);
                    keyed(obj).map(|(key, obj)| self.cache.upsert(key, obj))
                }
                Some(Ok(Notification::Deleted(obj))) => {
                    session.advance(&obj);
                    let change = keyed(obj).and_then(|(key, _)| self.cache.remove(&key));
                    if change.is_none() {
                        debug!("Ignoring delete of an object that is not cached");
                    }
                    change
                }
                Some(Ok(Notification::Bookmark(version))) => {
                    session.bookmark = version;
                    None
                }
                Some(Err(e)) => {
                    debug!("Watch failed at resource version {}", session.bookmark);
                    if session.healthy(self.backoff.max_delay()) {
                        self.backoff.reset();
                    }
                    return State::Reconnecting(Error::StreamDisconnected(e));
                }
                None if session.healthy(self.backoff.max_delay()) => {
                    debug!(
                        "Watch closed by the server at resource version {}, relisting",
                        session.bookmark
                    );
                    self.backoff.reset();
                    return State::Initializing;
                }
                None => {
                    return State::Reconnecting(Error::StreamDisconnected(source::Error::Closed))
                }
            };

            if let Some(change) = change {
                debug!("Observed {} of {}", change.kind, change.key);
                if !self.deliver(vec![change], shutdown).await {
                    return State::Stopping;
                }
            }
        }
    }

    async fn reconnect(&mut self, cause: Error, shutdown: &mut ShutdownWatch) -> State {
        let Some(delay) = self.backoff.next_delay() else {
            error!("Giving up on watch after {} attempts: {}", self.backoff.attempts(), cause);
            return State::Failed(Error::RetryCeilingExceeded {
                attempts: self.backoff.attempts(),
                last: Box::new(cause),
            });
        };

        warn!("{}, resyncing in {:?}", cause, delay);
        select! {
            biased;
            _ = cancelled(shutdown) => State::Stopping,
            _ = tokio::time::sleep(delay) => State::Initializing,
        }
    }

    /// Publishes the current cache and hands the changes to the handlers.
    /// Returns false when cancelled part way through.
    async fn deliver(&mut self, changes: Vec<Change<K>>, shutdown: &mut ShutdownWatch) -> bool {
        self.publish();
        if changes.is_empty() {
            return true;
        }

        let handlers = &self.handlers;
        let grace = self.config.handler_grace;
        select! {
            biased;
            _ = cancelled(shutdown) => false,
            _ = async {
                for change in &changes {
                    handlers.dispatch(change, grace).await;
                }
            } => true,
        }
    }

    /// Snapshots copy the whole cache, so skip them while nobody reads.
    fn publish(&self) {
        if self.snapshots.receiver_count() > 0 {
            self.snapshots.send_replace(self.cache.snapshot());
        }
    }
}

fn keyed<K: Object>(obj: K) -> Option<(ObjectKey, K)> {
    match ObjectKey::of(&obj) {
        Some(key) => Some((key, obj)),
        None => {
            warn!("Skipping object without a name: {:?}", obj.meta());
            None
        }
    }
}

/// Resolves once shutdown has been requested or the sender is gone.
async fn cancelled(shutdown: &mut ShutdownWatch) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
