//! Cluster API capability
//!
//! The narrow surface of the Kubernetes API the operator needs. The watcher
//! and applier receive it as an injected `Arc<dyn ClusterApi>`; production
//! uses [`crate::adapters::KubeClusterApi`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::api::WatchEvent;

use crate::composer::{DependentKind, DependentObject};
use crate::crd::Database;
use crate::error::Result;

/// Snapshot of the intent collection
#[derive(Clone, Debug, Default)]
pub struct IntentList {
    pub items: Vec<Database>,
    /// Collection resource version the snapshot was taken at
    pub resource_version: Option<String>,
}

/// Stream of raw watch events for the intent collection
pub type IntentWatchStream = BoxStream<'static, Result<WatchEvent<Database>>>;

#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// List every intent visible to the operator
    async fn list_databases(&self) -> Result<IntentList>;

    /// Watch intents starting after `resource_version`
    async fn watch_databases(&self, resource_version: &str) -> Result<IntentWatchStream>;

    /// Fetch a dependent object, `None` when it does not exist
    async fn get_dependent(
        &self,
        kind: DependentKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DependentObject>>;

    /// Create a dependent object
    async fn create_dependent(&self, object: &DependentObject) -> Result<()>;
}
