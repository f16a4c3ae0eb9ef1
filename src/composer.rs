//! Desired-state composer
//!
//! Maps one `Database` intent to the ordered dependent objects that realise
//! it: credential store, storage claim, workload and network endpoint.
//! Composition is pure; identical intents always yield identical objects.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    Secret, SecretKeySelector, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use serde::Serialize;

use crate::adapters::CredentialPolicy;
use crate::crd::Database;
use crate::error::{Error, Result};

/// Value of the `app.kubernetes.io/managed-by` label on dependent objects
pub const MANAGER_NAME: &str = "database-operator";

const DATA_VOLUME: &str = "data";

/// Supported database engines
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Engine {
    Mysql,
    Postgres,
}

impl Engine {
    /// Container image for the engine
    pub fn image(self) -> &'static str {
        match self {
            Engine::Mysql => "mysql:8.0",
            Engine::Postgres => "postgres:latest",
        }
    }

    /// Port the engine listens on
    pub fn port(self) -> i32 {
        match self {
            Engine::Mysql => 3306,
            Engine::Postgres => 5432,
        }
    }

    /// Where the engine keeps its data files
    pub fn data_path(self) -> &'static str {
        match self {
            Engine::Mysql => "/var/lib/mysql",
            Engine::Postgres => "/var/lib/postgresql/data",
        }
    }

    /// Credential keys the engine image reads from its environment
    pub fn credential_keys(self) -> &'static [&'static str] {
        match self {
            Engine::Mysql => &[
                "MYSQL_ROOT_PASSWORD",
                "MYSQL_USER",
                "MYSQL_PASSWORD",
                "MYSQL_DATABASE",
            ],
            Engine::Postgres => &["POSTGRES_PASSWORD", "POSTGRES_USER", "POSTGRES_DB"],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Mysql => "mysql",
            Engine::Postgres => "postgres",
        }
    }
}

impl FromStr for Engine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mysql" => Ok(Engine::Mysql),
            "postgres" => Ok(Engine::Postgres),
            other => Err(Error::validation(format!(
                "Invalid engine '{}': must be one of: mysql, postgres",
                other
            ))),
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kinds of dependent objects, in application order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DependentKind {
    CredentialStore,
    StorageClaim,
    Workload,
    NetworkEndpoint,
}

impl DependentKind {
    /// All kinds in the order they must be applied
    pub const ORDERED: [DependentKind; 4] = [
        DependentKind::CredentialStore,
        DependentKind::StorageClaim,
        DependentKind::Workload,
        DependentKind::NetworkEndpoint,
    ];

    /// Derived object name for an intent called `intent_name`
    pub fn object_name(self, intent_name: &str) -> String {
        match self {
            DependentKind::CredentialStore => format!("{}-credentials", intent_name),
            DependentKind::StorageClaim => format!("{}-pvc", intent_name),
            DependentKind::Workload => intent_name.to_string(),
            DependentKind::NetworkEndpoint => format!("{}-service", intent_name),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DependentKind::CredentialStore => "CredentialStore",
            DependentKind::StorageClaim => "StorageClaim",
            DependentKind::Workload => "Workload",
            DependentKind::NetworkEndpoint => "NetworkEndpoint",
        }
    }
}

impl fmt::Display for DependentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully specified dependent object
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", content = "object")]
pub enum DependentObject {
    CredentialStore(Secret),
    StorageClaim(PersistentVolumeClaim),
    Workload(Deployment),
    NetworkEndpoint(Service),
}

impl DependentObject {
    pub fn kind(&self) -> DependentKind {
        match self {
            DependentObject::CredentialStore(_) => DependentKind::CredentialStore,
            DependentObject::StorageClaim(_) => DependentKind::StorageClaim,
            DependentObject::Workload(_) => DependentKind::Workload,
            DependentObject::NetworkEndpoint(_) => DependentKind::NetworkEndpoint,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            DependentObject::CredentialStore(o) => &o.metadata,
            DependentObject::StorageClaim(o) => &o.metadata,
            DependentObject::Workload(o) => &o.metadata,
            DependentObject::NetworkEndpoint(o) => &o.metadata,
        }
    }

    pub fn name(&self) -> &str {
        self.metadata().name.as_deref().unwrap_or_default()
    }

    pub fn namespace(&self) -> &str {
        self.metadata().namespace.as_deref().unwrap_or("default")
    }
}

/// Validate an intent and resolve its engine
pub fn validate(intent: &Database) -> Result<Engine> {
    if intent.metadata.name.as_deref().unwrap_or_default().is_empty() {
        return Err(Error::validation("Database name must not be empty"));
    }

    let engine = intent.spec.engine.parse::<Engine>()?;

    if intent.spec.replicas < 1 {
        return Err(Error::validation(format!(
            "Invalid replicas {}: must be at least 1",
            intent.spec.replicas
        )));
    }

    if intent.spec.storage_size.trim().is_empty() {
        return Err(Error::validation("Storage size must not be empty"));
    }

    Ok(engine)
}

/// Compose the ordered dependent objects for an intent
pub fn compose(intent: &Database, credentials: &dyn CredentialPolicy) -> Result<Vec<DependentObject>> {
    let engine = validate(intent)?;
    let name = intent.name_any();
    let namespace = intent.namespace().unwrap_or_else(|| "default".to_string());

    let secret_data = credentials.credentials(intent, engine);
    for key in engine.credential_keys() {
        if !secret_data.contains_key(*key) {
            return Err(Error::config(format!(
                "Credential policy did not supply '{}' for {}/{}",
                key, namespace, name
            )));
        }
    }

    let meta = |kind: DependentKind| ObjectMeta {
        name: Some(kind.object_name(&name)),
        namespace: Some(namespace.clone()),
        labels: Some(common_labels(&name)),
        owner_references: owner_reference(intent).map(|r| vec![r]),
        ..Default::default()
    };

    let secret = Secret {
        metadata: meta(DependentKind::CredentialStore),
        type_: Some("Opaque".to_string()),
        string_data: Some(secret_data),
        ..Default::default()
    };

    let claim = PersistentVolumeClaim {
        metadata: meta(DependentKind::StorageClaim),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(intent.spec.storage_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    };

    let secret_name = DependentKind::CredentialStore.object_name(&name);
    let env = engine
        .credential_keys()
        .iter()
        .map(|key| EnvVar {
            name: key.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret_name.clone(),
                    key: key.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    let workload = Deployment {
        metadata: meta(DependentKind::Workload),
        spec: Some(DeploymentSpec {
            replicas: Some(intent.spec.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(&name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(common_labels(&name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.clone(),
                        image: Some(engine.image().to_string()),
                        env: Some(env),
                        ports: Some(vec![ContainerPort {
                            container_port: engine.port(),
                            name: Some(engine.as_str().to_string()),
                            ..Default::default()
                        }]),
                        volume_mounts: Some(vec![VolumeMount {
                            name: DATA_VOLUME.to_string(),
                            mount_path: engine.data_path().to_string(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: DATA_VOLUME.to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: DependentKind::StorageClaim.object_name(&name),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    let endpoint = Service {
        metadata: meta(DependentKind::NetworkEndpoint),
        spec: Some(ServiceSpec {
            selector: Some(selector_labels(&name)),
            ports: Some(vec![ServicePort {
                name: Some(engine.as_str().to_string()),
                port: engine.port(),
                target_port: Some(IntOrString::Int(engine.port())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    };

    Ok(vec![
        DependentObject::CredentialStore(secret),
        DependentObject::StorageClaim(claim),
        DependentObject::Workload(workload),
        DependentObject::NetworkEndpoint(endpoint),
    ])
}

/// Labels the workload selects on and the endpoint routes to
pub fn selector_labels(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), name.to_string())])
}

fn common_labels(name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(name);
    labels.insert(
        "app.kubernetes.io/managed-by".to_string(),
        MANAGER_NAME.to_string(),
    );
    labels.insert("app.kubernetes.io/instance".to_string(), name.to_string());
    labels
}

fn owner_reference(intent: &Database) -> Option<OwnerReference> {
    // Intents built outside the API server carry no UID.
    intent.metadata.uid.as_ref()?;
    intent.controller_owner_ref(&())
}
