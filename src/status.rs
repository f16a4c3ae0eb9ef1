//! Status reporting
//!
//! Every reconciliation report goes to a [`StatusSink`]. Sinks never fail
//! the reconciliation; problems are logged and counted.

use async_trait::async_trait;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{info, warn};

use crate::composer::MANAGER_NAME;
use crate::crd::{Condition, Database, DatabaseStatus, DependentStatus};
use crate::metrics;
use crate::reconcilers::database::{IntentPhase, ReconcileReport};

#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn report(&self, report: &ReconcileReport);
}

/// Writes each report as a structured log line
#[derive(Clone, Debug, Default)]
pub struct LogStatusSink;

#[async_trait]
impl StatusSink for LogStatusSink {
    async fn report(&self, report: &ReconcileReport) {
        log_report(report);
    }
}

fn log_report(report: &ReconcileReport) {
    let outcomes: Vec<String> = report
        .results
        .iter()
        .map(|r| format!("{}={}", r.kind, r.outcome.label()))
        .collect();

    info!(
        intent = %report.key,
        phase = %report.phase,
        outcomes = ?outcomes,
        retry = report.retry,
        detail = %report.message,
        timestamp = %report.timestamp,
        "Reconcile outcome"
    );
}

/// Logs each report and mirrors it into the `Database` status subresource
#[derive(Clone)]
pub struct KubeStatusSink {
    client: Client,
}

impl KubeStatusSink {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn report(&self, report: &ReconcileReport) {
        log_report(report);

        if report.phase == IntentPhase::Tombstoned {
            return;
        }

        let status = status_for(report);
        if !needs_update(report.intent.status.as_ref(), &status) {
            return;
        }

        let api: Api<Database> = Api::namespaced(self.client.clone(), &report.key.namespace);
        let patch = json!({ "status": status });
        if let Err(e) = api
            .patch_status(
                &report.key.name,
                &PatchParams::apply(MANAGER_NAME),
                &Patch::Merge(patch),
            )
            .await
        {
            warn!(intent = %report.key, error = %e, "Failed to update Database status");
            metrics::STATUS_REPORT_ERRORS
                .with_label_values(&[&report.key.namespace])
                .inc();
        }
    }
}

/// Status subresource content for a report
pub fn status_for(report: &ReconcileReport) -> DatabaseStatus {
    let converged = report.phase == IntentPhase::Converged;
    DatabaseStatus {
        phase: Some(report.phase.to_string()),
        message: Some(report.message.clone()),
        observed_generation: report.intent.metadata.generation,
        last_reconcile_time: Some(report.timestamp),
        resources: report
            .results
            .iter()
            .map(|r| DependentStatus {
                kind: r.kind.to_string(),
                name: r.name.clone(),
                outcome: r.outcome.label().to_string(),
            })
            .collect(),
        conditions: vec![Condition {
            type_: "Ready".to_string(),
            status: if converged { "True" } else { "False" }.to_string(),
            last_transition_time: report.timestamp,
            reason: Some(report.phase.to_string()),
            message: Some(report.message.clone()),
        }],
    }
}

/// Whether `next` differs from `current` in anything but timestamps
pub fn needs_update(current: Option<&DatabaseStatus>, next: &DatabaseStatus) -> bool {
    let Some(current) = current else {
        return true;
    };
    current.phase != next.phase
        || current.message != next.message
        || current.observed_generation != next.observed_generation
        || current.resources != next.resources
}
