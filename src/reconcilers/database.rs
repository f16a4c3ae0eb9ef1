//! Database reconciler
//!
//! Converts one change notification into ordered apply calls:
//! credential store and storage claim first, then the workload that mounts
//! them, then the network endpoint. The first unsuccessful apply halts the
//! remaining steps so the ordering dependency is never violated.

use std::fmt;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use crate::applier::ReconcileOutcome;
use crate::composer::{self, DependentKind};
use crate::controllers::Context;
use crate::crd::Database;
use crate::metrics;
use crate::watcher::{ChangeKind, IntentEvent, IntentKey};

/// Convergence state of one intent
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntentPhase {
    /// Event received, waiting for a worker
    Pending,
    /// Dependent objects are being applied
    Applying,
    /// Every dependent object exists and matches the intent
    Converged,
    /// Last attempt stopped early; retried on backoff or on the next event
    Degraded,
    /// Intent was deleted
    Tombstoned,
}

impl IntentPhase {
    pub const ALL: [IntentPhase; 5] = [
        IntentPhase::Pending,
        IntentPhase::Applying,
        IntentPhase::Converged,
        IntentPhase::Degraded,
        IntentPhase::Tombstoned,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IntentPhase::Pending => "Pending",
            IntentPhase::Applying => "Applying",
            IntentPhase::Converged => "Converged",
            IntentPhase::Degraded => "Degraded",
            IntentPhase::Tombstoned => "Tombstoned",
        }
    }
}

impl fmt::Display for IntentPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of applying one dependent object
#[derive(Clone, Debug, PartialEq)]
pub struct DependentResult {
    pub kind: DependentKind,
    pub name: String,
    pub outcome: ReconcileOutcome,
}

/// Aggregate result of one reconciliation attempt
#[derive(Clone, Debug)]
pub struct ReconcileReport {
    pub key: IntentKey,
    pub change: ChangeKind,
    /// Intent as delivered with the event
    pub intent: Database,
    pub phase: IntentPhase,
    /// Results in application order; steps after a failure are absent
    pub results: Vec<DependentResult>,
    pub message: String,
    /// Whether a backoff retry should be scheduled
    pub retry: bool,
    pub timestamp: DateTime<Utc>,
}

impl ReconcileReport {
    fn new(event: &IntentEvent, phase: IntentPhase, message: impl Into<String>) -> Self {
        Self {
            key: event.key(),
            change: event.change,
            intent: event.intent.clone(),
            phase,
            results: Vec::new(),
            message: message.into(),
            retry: false,
            timestamp: Utc::now(),
        }
    }

    /// Outcome recorded for `kind`, if that step ran
    pub fn outcome(&self, kind: DependentKind) -> Option<&ReconcileOutcome> {
        self.results
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| &r.outcome)
    }
}

/// Reconcile one event
///
/// Never fails: every problem is folded into the returned report. When
/// `shutdown` is cancelled the current apply call finishes but no further
/// step is started.
#[instrument(
    skip(ctx, event, shutdown),
    fields(name = %event.intent.name_any(), namespace = event.intent.namespace(), change = %event.change)
)]
pub async fn reconcile(
    ctx: &Context,
    event: &IntentEvent,
    shutdown: &CancellationToken,
) -> ReconcileReport {
    let key = event.key();

    if event.change == ChangeKind::Deleted {
        info!(intent = %key, "Database deleted, dependent objects left to garbage collection");
        return ReconcileReport::new(event, IntentPhase::Tombstoned, "Database deleted");
    }

    info!(
        intent = %key,
        change = %event.change,
        engine = %event.intent.spec.engine,
        replicas = event.intent.spec.replicas,
        "Reconciling Database"
    );

    let objects = match composer::compose(&event.intent, ctx.credentials.as_ref()) {
        Ok(objects) => objects,
        Err(e) => {
            warn!(intent = %key, error = %e, "Composition failed");
            return ReconcileReport::new(event, IntentPhase::Degraded, e.to_string());
        }
    };

    let mut report = ReconcileReport::new(event, IntentPhase::Applying, String::new());

    for object in &objects {
        if shutdown.is_cancelled() {
            report.phase = IntentPhase::Degraded;
            report.message = "Interrupted by operator shutdown".to_string();
            return report;
        }

        let outcome = ctx.applier.apply(object).await;
        metrics::APPLY_OUTCOMES
            .with_label_values(&[object.kind().as_str(), outcome.label()])
            .inc();

        let failed = !outcome.is_success();
        if failed {
            report.phase = IntentPhase::Degraded;
            report.retry = outcome.is_retryable();
            report.message = format!("{} {}: {}", object.kind(), object.name(), outcome);
            warn!(
                intent = %key,
                kind = %object.kind(),
                name = object.name(),
                outcome = %outcome,
                retry = report.retry,
                "Apply failed, halting remaining steps"
            );
        }

        report.results.push(DependentResult {
            kind: object.kind(),
            name: object.name().to_string(),
            outcome,
        });

        if failed {
            return report;
        }
    }

    report.phase = IntentPhase::Converged;
    report.message = "All dependent objects are present".to_string();
    info!(intent = %key, "Database converged");
    report
}
