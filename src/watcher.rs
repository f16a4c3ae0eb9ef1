//! Resource watcher
//!
//! Turns list + watch calls against the intent collection into an endless
//! stream of typed change notifications. The stream survives disconnects by
//! resuming from the last observed resource version and falls back to a full
//! relist when the server reports that version as expired (410 Gone).
//! Events are not deduplicated.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::api::WatchEvent;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::cluster::{ClusterApi, IntentWatchStream};
use crate::crd::Database;
use crate::error::Result;
use crate::metrics;

/// Kind of change observed for an intent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Added,
    Modified,
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Added => "Added",
            ChangeKind::Modified => "Modified",
            ChangeKind::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// Identity of an intent: namespace and name
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IntentKey {
    pub namespace: String,
    pub name: String,
}

impl IntentKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(intent: &Database) -> Self {
        Self::new(
            intent.namespace().unwrap_or_else(|| "default".to_string()),
            intent.name_any(),
        )
    }
}

impl fmt::Display for IntentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// One change notification
#[derive(Clone, Debug)]
pub struct IntentEvent {
    pub change: ChangeKind,
    pub intent: Database,
}

impl IntentEvent {
    pub fn new(change: ChangeKind, intent: Database) -> Self {
        Self { change, intent }
    }

    pub fn key(&self) -> IntentKey {
        IntentKey::of(&self.intent)
    }
}

enum Phase {
    /// Full listing; `relist` marks a recovery after an expired resume token
    List { relist: bool },
    /// Open a watch from the current resume token
    Watch,
    Streaming(IntentWatchStream),
}

/// Resumable watch over the `Database` collection
pub struct IntentWatcher {
    cluster: Arc<dyn ClusterApi>,
    backoff: Backoff,
    phase: Phase,
    resource_version: Option<String>,
    known: BTreeMap<IntentKey, Database>,
    pending: VecDeque<IntentEvent>,
    failures: u32,
}

impl IntentWatcher {
    pub fn new(cluster: Arc<dyn ClusterApi>, backoff: Backoff) -> Self {
        Self {
            cluster,
            backoff,
            phase: Phase::List { relist: false },
            resource_version: None,
            known: BTreeMap::new(),
            pending: VecDeque::new(),
            failures: 0,
        }
    }

    /// Last resource version observed
    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    /// Convert into an endless stream of change notifications
    pub fn into_stream(self) -> impl Stream<Item = IntentEvent> + Send {
        futures::stream::unfold(self, |mut watcher| async move {
            let event = watcher.next_event().await;
            Some((event, watcher))
        })
    }

    /// Wait for the next change notification
    pub async fn next_event(&mut self) -> IntentEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }

            match &mut self.phase {
                Phase::List { relist } => {
                    let relist = *relist;
                    match self.cluster.list_databases().await {
                        Ok(list) => {
                            info!(
                                count = list.items.len(),
                                resource_version = ?list.resource_version,
                                relist,
                                "Listed Database resources"
                            );
                            self.apply_listing(list.items, relist);
                            metrics::mark_ready();
                            self.resource_version = list.resource_version;
                            self.failures = 0;
                            self.phase = Phase::Watch;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to list Database resources");
                            self.sleep_after_failure().await;
                        }
                    }
                }
                Phase::Watch => {
                    let Some(version) = self.resource_version.clone() else {
                        self.phase = Phase::List { relist: true };
                        continue;
                    };
                    match self.cluster.watch_databases(&version).await {
                        Ok(stream) => {
                            debug!(resource_version = %version, "Watch established");
                            self.phase = Phase::Streaming(stream);
                        }
                        Err(e) if e.api_code() == Some(410) => {
                            warn!(resource_version = %version, "Resume token expired, relisting");
                            self.phase = Phase::List { relist: true };
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to open watch");
                            self.sleep_after_failure().await;
                        }
                    }
                }
                Phase::Streaming(stream) => {
                    let item = stream.next().await;
                    if let Some(event) = self.on_watch_item(item).await {
                        return event;
                    }
                }
            }
        }
    }

    async fn on_watch_item(
        &mut self,
        item: Option<Result<WatchEvent<Database>>>,
    ) -> Option<IntentEvent> {
        match item {
            Some(Ok(WatchEvent::Added(db))) => Some(self.observe(ChangeKind::Added, db)),
            Some(Ok(WatchEvent::Modified(db))) => Some(self.observe(ChangeKind::Modified, db)),
            Some(Ok(WatchEvent::Deleted(db))) => Some(self.observe(ChangeKind::Deleted, db)),
            Some(Ok(WatchEvent::Bookmark(bookmark))) => {
                self.resource_version = Some(bookmark.metadata.resource_version);
                None
            }
            Some(Ok(WatchEvent::Error(resp))) if resp.code == 410 => {
                warn!(reason = %resp.message, "Watch resume token expired, relisting");
                self.phase = Phase::List { relist: true };
                None
            }
            Some(Ok(WatchEvent::Error(resp))) => {
                warn!(code = resp.code, reason = %resp.message, "Watch returned error");
                self.phase = Phase::Watch;
                self.sleep_after_failure().await;
                None
            }
            Some(Err(e)) => {
                warn!(error = %e, "Watch stream failed, reconnecting");
                self.phase = Phase::Watch;
                self.sleep_after_failure().await;
                None
            }
            None => {
                debug!("Watch stream ended, resuming");
                metrics::WATCH_RESTARTS.with_label_values(&["ended"]).inc();
                self.phase = Phase::Watch;
                None
            }
        }
    }

    fn observe(&mut self, change: ChangeKind, intent: Database) -> IntentEvent {
        if let Some(version) = intent.resource_version() {
            self.resource_version = Some(version);
        }
        self.failures = 0;

        let key = IntentKey::of(&intent);
        if change == ChangeKind::Deleted {
            self.known.remove(&key);
        } else {
            self.known.insert(key, intent.clone());
        }
        IntentEvent::new(change, intent)
    }

    fn apply_listing(&mut self, items: Vec<Database>, relist: bool) {
        let change = if relist {
            metrics::WATCH_RESTARTS.with_label_values(&["relist"]).inc();
            ChangeKind::Modified
        } else {
            ChangeKind::Added
        };

        let mut current = BTreeMap::new();
        for intent in items {
            current.insert(IntentKey::of(&intent), intent);
        }

        // Intents that vanished while we could not watch
        let previous = std::mem::take(&mut self.known);
        for (key, intent) in previous {
            if !current.contains_key(&key) {
                self.pending
                    .push_back(IntentEvent::new(ChangeKind::Deleted, intent));
            }
        }

        for intent in current.values() {
            self.pending.push_back(IntentEvent::new(change, intent.clone()));
        }
        self.known = current;
    }

    async fn sleep_after_failure(&mut self) {
        metrics::WATCH_RESTARTS.with_label_values(&["error"]).inc();
        let delay = self.backoff.delay(self.failures);
        self.failures = self.failures.saturating_add(1);
        tokio::time::sleep(delay).await;
    }
}
