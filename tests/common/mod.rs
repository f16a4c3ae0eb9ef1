//! Shared test fixtures: an in-memory `ClusterApi` and helpers

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use database_operator::adapters::DerivedCredentials;
use database_operator::cluster::{ClusterApi, IntentList, IntentWatchStream};
use database_operator::composer::{DependentKind, DependentObject};
use database_operator::crd::{Database, DatabaseSpec};
use database_operator::error::{Error, Result};
use database_operator::reconcilers::database::ReconcileReport;
use database_operator::status::StatusSink;
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::WatchEvent;
use kube::core::ErrorResponse;
use tokio::sync::{mpsc, Notify};

pub fn database(name: &str, engine: &str, replicas: i32) -> Database {
    database_at(name, engine, replicas, "1")
}

pub fn database_at(name: &str, engine: &str, replicas: i32, resource_version: &str) -> Database {
    Database {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            resource_version: Some(resource_version.to_string()),
            generation: Some(1),
            ..Default::default()
        },
        spec: DatabaseSpec {
            engine: engine.to_string(),
            replicas,
            storage_size: "10Gi".to_string(),
        },
        status: None,
    }
}

pub fn credentials() -> DerivedCredentials {
    DerivedCredentials::new(b"test-seed-0123456789".to_vec())
}

pub fn api_error(code: u16, message: &str) -> Error {
    Error::Kube(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: message.to_string(),
        reason: String::new(),
        code,
    }))
}

/// Recorded cluster call
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Get(DependentKind, String),
    Create(DependentKind, String),
}

/// Scripted response to `watch_databases`
pub enum WatchScript {
    Fail(u16),
    Events(Vec<Result<WatchEvent<Database>>>),
}

type ObjectKey = (DependentKind, String, String);

#[derive(Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectKey, DependentObject>>,
    calls: Mutex<Vec<Call>>,
    create_failures: Mutex<HashMap<DependentKind, VecDeque<u16>>>,
    races: Mutex<HashMap<DependentKind, DependentObject>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
    in_flight: Mutex<HashMap<String, usize>>,
    max_in_flight: Mutex<HashMap<String, usize>>,
    lists: Mutex<VecDeque<std::result::Result<IntentList, u16>>>,
    watches: Mutex<VecDeque<WatchScript>>,
    watch_versions: Mutex<Vec<String>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next create of `kind` with an API error of `code`
    pub fn fail_next_create(&self, kind: DependentKind, code: u16) {
        self.create_failures
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push_back(code);
    }

    /// On the next create of this object's kind, store `winner` first and
    /// answer 409 as if a concurrent writer won the race
    pub fn race_next_create(&self, winner: DependentObject) {
        self.races.lock().unwrap().insert(winner.kind(), winner);
    }

    /// Block creates for intent `name` until the returned notify is signalled
    pub fn gate(&self, name: &str) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.gates
            .lock()
            .unwrap()
            .insert(name.to_string(), notify.clone());
        notify
    }

    pub fn insert(&self, object: DependentObject) {
        let key = (
            object.kind(),
            object.namespace().to_string(),
            object.name().to_string(),
        );
        self.objects.lock().unwrap().insert(key, object);
    }

    pub fn object(&self, kind: DependentKind, name: &str) -> Option<DependentObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&(kind, "default".to_string(), name.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn creates(&self) -> Vec<(DependentKind, String)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Create(kind, name) => Some((kind, name)),
                Call::Get(..) => None,
            })
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn max_in_flight(&self, intent: &str) -> usize {
        self.max_in_flight
            .lock()
            .unwrap()
            .get(intent)
            .copied()
            .unwrap_or(0)
    }

    pub fn push_list(&self, items: Vec<Database>, resource_version: &str) {
        self.lists.lock().unwrap().push_back(Ok(IntentList {
            items,
            resource_version: Some(resource_version.to_string()),
        }));
    }

    pub fn push_list_failure(&self, code: u16) {
        self.lists.lock().unwrap().push_back(Err(code));
    }

    pub fn push_watch(&self, script: WatchScript) {
        self.watches.lock().unwrap().push_back(script);
    }

    pub fn watch_versions(&self) -> Vec<String> {
        self.watch_versions.lock().unwrap().clone()
    }

    fn enter(&self, intent: &str) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let current = in_flight.entry(intent.to_string()).or_default();
        *current += 1;
        let mut max = self.max_in_flight.lock().unwrap();
        let seen = max.entry(intent.to_string()).or_default();
        *seen = (*seen).max(*current);
    }

    fn leave(&self, intent: &str) {
        if let Some(current) = self.in_flight.lock().unwrap().get_mut(intent) {
            *current -= 1;
        }
    }
}

fn intent_of(object: &DependentObject) -> String {
    object
        .metadata()
        .labels
        .as_ref()
        .and_then(|l| l.get("app"))
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn list_databases(&self) -> Result<IntentList> {
        match self.lists.lock().unwrap().pop_front() {
            Some(Ok(list)) => Ok(list),
            Some(Err(code)) => Err(api_error(code, "list failed")),
            None => Ok(IntentList {
                items: vec![],
                resource_version: Some("0".to_string()),
            }),
        }
    }

    async fn watch_databases(&self, resource_version: &str) -> Result<IntentWatchStream> {
        self.watch_versions
            .lock()
            .unwrap()
            .push(resource_version.to_string());
        let script = self.watches.lock().unwrap().pop_front();
        match script {
            Some(WatchScript::Fail(code)) => Err(api_error(code, "watch failed")),
            Some(WatchScript::Events(events)) => Ok(futures::stream::iter(events).boxed()),
            None => Ok(futures::stream::pending::<Result<WatchEvent<Database>>>().boxed()),
        }
    }

    async fn get_dependent(
        &self,
        kind: DependentKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DependentObject>> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Get(kind, name.to_string()));
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn create_dependent(&self, object: &DependentObject) -> Result<()> {
        let intent = intent_of(object);
        self.enter(&intent);

        let gate = self.gates.lock().unwrap().get(&intent).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        self.calls
            .lock()
            .unwrap()
            .push(Call::Create(object.kind(), object.name().to_string()));

        let failure = self
            .create_failures
            .lock()
            .unwrap()
            .get_mut(&object.kind())
            .and_then(|q| q.pop_front());

        let race = self.races.lock().unwrap().remove(&object.kind());
        if let Some(winner) = race {
            self.insert(winner);
        }

        let result = match failure {
            Some(code) => Err(api_error(code, "injected failure")),
            None => {
                let key = (
                    object.kind(),
                    object.namespace().to_string(),
                    object.name().to_string(),
                );
                let mut objects = self.objects.lock().unwrap();
                if objects.contains_key(&key) {
                    Err(api_error(409, "already exists"))
                } else {
                    objects.insert(key, object.clone());
                    Ok(())
                }
            }
        };

        self.leave(&intent);
        result
    }
}

/// Status sink forwarding every report to a channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ReconcileReport>,
}

impl ChannelSink {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ReconcileReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl StatusSink for ChannelSink {
    async fn report(&self, report: &ReconcileReport) {
        let _ = self.tx.send(report.clone());
    }
}
