//! Applier
//!
//! Create-or-confirm of a single dependent object. Every cluster response is
//! classified into a [`ReconcileOutcome`]; retry policy lives in the
//! reconciler, never here.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::cluster::ClusterApi;
use crate::composer::{DependentObject, MANAGER_NAME};
use crate::error::Error;

const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Result of applying one dependent object
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Object did not exist and was created
    Created,
    /// Object exists and matches the desired identity fields
    AlreadyExists,
    /// Object exists but does not match, or a concurrent writer interfered
    Conflict(String),
    /// Cluster API unavailable or throttling; retry later
    TransientError(String),
    /// Request can never succeed as is
    FatalError(String),
}

impl ReconcileOutcome {
    /// Short label used in status and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Created => "Created",
            ReconcileOutcome::AlreadyExists => "AlreadyExists",
            ReconcileOutcome::Conflict(_) => "Conflict",
            ReconcileOutcome::TransientError(_) => "TransientError",
            ReconcileOutcome::FatalError(_) => "FatalError",
        }
    }

    /// Whether the object can be considered present and current
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Created | ReconcileOutcome::AlreadyExists
        )
    }

    /// Whether a later attempt may succeed without a new intent
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Conflict(_) | ReconcileOutcome::TransientError(_)
        )
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            ReconcileOutcome::Conflict(m)
            | ReconcileOutcome::TransientError(m)
            | ReconcileOutcome::FatalError(m) => Some(m),
            _ => None,
        }
    }
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.detail() {
            Some(detail) => write!(f, "{}: {}", self.label(), detail),
            None => f.write_str(self.label()),
        }
    }
}

/// Classify an API failure
pub fn classify(error: &Error) -> ReconcileOutcome {
    let message = error.to_string();
    match error {
        Error::Kube(kube::Error::Api(resp)) => match resp.code {
            409 => ReconcileOutcome::Conflict(message),
            // Quota admission rejects with 403 while usage is above the limit.
            403 if resp.message.contains("exceeded quota") => {
                ReconcileOutcome::TransientError(message)
            }
            // Namespace not found yet
            404 => ReconcileOutcome::TransientError(message),
            408 | 429 | 500 | 502 | 503 | 504 => ReconcileOutcome::TransientError(message),
            _ => ReconcileOutcome::FatalError(message),
        },
        Error::Kube(kube::Error::SerdeError(_)) | Error::Kube(kube::Error::BuildRequest(_)) => {
            ReconcileOutcome::FatalError(message)
        }
        Error::Kube(_) | Error::Io(_) => ReconcileOutcome::TransientError(message),
        Error::Config(_) | Error::Validation(_) | Error::Serialization(_) => {
            ReconcileOutcome::FatalError(message)
        }
    }
}

/// Applies dependent objects against the cluster
#[derive(Clone)]
pub struct Applier {
    cluster: Arc<dyn ClusterApi>,
}

impl Applier {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Create `desired` unless an object with its name already exists
    pub async fn apply(&self, desired: &DependentObject) -> ReconcileOutcome {
        let (kind, namespace, name) = (desired.kind(), desired.namespace(), desired.name());

        match self.cluster.get_dependent(kind, namespace, name).await {
            Ok(Some(existing)) => return compare(desired, &existing),
            Ok(None) => {}
            Err(e) => return classify(&e),
        }

        match self.cluster.create_dependent(desired).await {
            Ok(()) => {
                debug!(%kind, namespace, name, "Created dependent object");
                ReconcileOutcome::Created
            }
            Err(e) if e.api_code() == Some(409) => {
                // Lost a creation race; judge the winner's object.
                match self.cluster.get_dependent(kind, namespace, name).await {
                    Ok(Some(existing)) => compare(desired, &existing),
                    Ok(None) => ReconcileOutcome::Conflict(format!(
                        "{} {}/{} was created concurrently and then removed",
                        kind, namespace, name
                    )),
                    Err(e) => classify(&e),
                }
            }
            Err(e) => classify(&e),
        }
    }
}

/// Compare the identity fields of an existing object with the desired one
pub fn compare(desired: &DependentObject, existing: &DependentObject) -> ReconcileOutcome {
    match mismatch(desired, existing) {
        None => ReconcileOutcome::AlreadyExists,
        Some(reason) => ReconcileOutcome::Conflict(format!(
            "{} {}/{} exists but {}",
            desired.kind(),
            desired.namespace(),
            desired.name(),
            reason
        )),
    }
}

fn mismatch(desired: &DependentObject, existing: &DependentObject) -> Option<String> {
    let managed_by = existing
        .metadata()
        .labels
        .as_ref()
        .and_then(|l| l.get(MANAGED_BY_LABEL));
    if let Some(manager) = managed_by {
        if manager != MANAGER_NAME {
            return Some(format!("is managed by '{}'", manager));
        }
    }

    match (desired, existing) {
        (DependentObject::CredentialStore(want), DependentObject::CredentialStore(have)) => {
            let have_keys: BTreeSet<&String> = have
                .data
                .iter()
                .flat_map(|d| d.keys())
                .chain(have.string_data.iter().flat_map(|d| d.keys()))
                .collect();
            let missing: Vec<&String> = want
                .string_data
                .iter()
                .flat_map(|d| d.keys())
                .filter(|k| !have_keys.contains(k))
                .collect();
            (!missing.is_empty()).then(|| format!("is missing keys {:?}", missing))
        }
        (DependentObject::StorageClaim(want), DependentObject::StorageClaim(have)) => {
            let want_spec = want.spec.as_ref();
            let have_spec = have.spec.as_ref();
            let modes = |s: Option<&k8s_openapi::api::core::v1::PersistentVolumeClaimSpec>| {
                s.and_then(|s| s.access_modes.clone()).unwrap_or_default()
            };
            let storage = |s: Option<&k8s_openapi::api::core::v1::PersistentVolumeClaimSpec>| {
                s.and_then(|s| s.resources.as_ref())
                    .and_then(|r| r.requests.as_ref())
                    .and_then(|r| r.get("storage"))
                    .map(|q| q.0.clone())
            };
            if modes(want_spec) != modes(have_spec) {
                return Some("has different access modes".to_string());
            }
            if storage(want_spec) != storage(have_spec) {
                return Some(format!(
                    "requests {:?} instead of {:?}",
                    storage(have_spec),
                    storage(want_spec)
                ));
            }
            None
        }
        (DependentObject::Workload(want), DependentObject::Workload(have)) => {
            let (Some(want), Some(have)) = (want.spec.as_ref(), have.spec.as_ref()) else {
                return Some("has no spec".to_string());
            };
            if want.selector.match_labels != have.selector.match_labels {
                return Some("selects different pods".to_string());
            }
            let image = |s: &k8s_openapi::api::apps::v1::DeploymentSpec| {
                s.template
                    .spec
                    .as_ref()
                    .and_then(|p| p.containers.first())
                    .and_then(|c| c.image.clone())
            };
            if image(want) != image(have) {
                return Some(format!("runs image {:?}", image(have)));
            }
            if want.replicas != have.replicas {
                // Replica drift is not reconciled in place.
                warn!(
                    desired = ?want.replicas,
                    actual = ?have.replicas,
                    "Workload replica count differs from intent"
                );
            }
            None
        }
        (DependentObject::NetworkEndpoint(want), DependentObject::NetworkEndpoint(have)) => {
            let selector = |s: &k8s_openapi::api::core::v1::Service| {
                s.spec.as_ref().and_then(|s| s.selector.clone())
            };
            let ports = |s: &k8s_openapi::api::core::v1::Service| -> BTreeSet<i32> {
                s.spec
                    .as_ref()
                    .and_then(|s| s.ports.as_ref())
                    .map(|p| p.iter().map(|p| p.port).collect())
                    .unwrap_or_default()
            };
            if selector(want) != selector(have) {
                return Some("selects different pods".to_string());
            }
            if ports(want) != ports(have) {
                return Some(format!("exposes ports {:?}", ports(have)));
            }
            None
        }
        _ => Some(format!("is a {} instead", existing.kind())),
    }
}
