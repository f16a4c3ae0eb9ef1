//! `ClusterApi` backed by a kube-rs client

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Secret, Service};
use kube::api::{ListParams, PostParams, WatchParams};
use kube::{Api, Client};
use tracing::debug;

use crate::cluster::{ClusterApi, IntentList, IntentWatchStream};
use crate::composer::{DependentKind, DependentObject, MANAGER_NAME};
use crate::crd::Database;
use crate::error::{Error, Result};

/// Server-side watch timeout; the stream ends cleanly afterwards
const WATCH_TIMEOUT_SECS: u32 = 290;

/// Bookmarks are requested by default and advance the resume token
fn watch_params() -> WatchParams {
    WatchParams::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Kubernetes API access, cluster-wide or restricted to one namespace
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    namespace: Option<String>,
}

impl KubeClusterApi {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }

    fn databases(&self) -> Api<Database> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }

    fn post_params() -> PostParams {
        PostParams {
            field_manager: Some(MANAGER_NAME.to_string()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn list_databases(&self) -> Result<IntentList> {
        let list = self.databases().list(&ListParams::default()).await?;
        Ok(IntentList {
            resource_version: list.metadata.resource_version,
            items: list.items,
        })
    }

    async fn watch_databases(&self, resource_version: &str) -> Result<IntentWatchStream> {
        let stream = self
            .databases()
            .watch(&watch_params(), resource_version)
            .await?;
        Ok(stream.map_err(Error::from).boxed())
    }

    async fn get_dependent(
        &self,
        kind: DependentKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DependentObject>> {
        let client = self.client.clone();
        let object = match kind {
            DependentKind::CredentialStore => Api::<Secret>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(DependentObject::CredentialStore),
            DependentKind::StorageClaim => {
                Api::<PersistentVolumeClaim>::namespaced(client, namespace)
                    .get_opt(name)
                    .await?
                    .map(DependentObject::StorageClaim)
            }
            DependentKind::Workload => Api::<Deployment>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(DependentObject::Workload),
            DependentKind::NetworkEndpoint => Api::<Service>::namespaced(client, namespace)
                .get_opt(name)
                .await?
                .map(DependentObject::NetworkEndpoint),
        };
        Ok(object)
    }

    async fn create_dependent(&self, object: &DependentObject) -> Result<()> {
        let client = self.client.clone();
        let namespace = object.namespace();
        let pp = Self::post_params();

        debug!(kind = %object.kind(), name = object.name(), namespace, "Creating dependent object");

        match object {
            DependentObject::CredentialStore(o) => {
                Api::<Secret>::namespaced(client, namespace).create(&pp, o).await?;
            }
            DependentObject::StorageClaim(o) => {
                Api::<PersistentVolumeClaim>::namespaced(client, namespace)
                    .create(&pp, o)
                    .await?;
            }
            DependentObject::Workload(o) => {
                Api::<Deployment>::namespaced(client, namespace)
                    .create(&pp, o)
                    .await?;
            }
            DependentObject::NetworkEndpoint(o) => {
                Api::<Service>::namespaced(client, namespace).create(&pp, o).await?;
            }
        }
        Ok(())
    }
}
