//! Reconciler tests against an in-memory cluster

mod common;

use std::sync::Arc;

use common::{credentials, database, Call, FakeCluster};
use database_operator::applier::ReconcileOutcome;
use database_operator::composer::{compose, DependentKind, DependentObject};
use database_operator::controllers::Context;
use database_operator::reconcilers::database::{reconcile, IntentPhase};
use database_operator::status::LogStatusSink;
use database_operator::watcher::{ChangeKind, IntentEvent};
use tokio_util::sync::CancellationToken;

fn context(cluster: &Arc<FakeCluster>) -> Context {
    Context::new(
        cluster.clone(),
        Arc::new(credentials()),
        Arc::new(LogStatusSink),
    )
}

fn added(name: &str, engine: &str, replicas: i32) -> IntentEvent {
    IntentEvent::new(ChangeKind::Added, database(name, engine, replicas))
}

fn outcome_labels(report: &database_operator::reconcilers::database::ReconcileReport) -> Vec<&'static str> {
    report.results.iter().map(|r| r.outcome.label()).collect()
}

#[tokio::test]
async fn added_intent_converges_in_order() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);

    let report = reconcile(&ctx, &added("orders", "mysql", 2), &CancellationToken::new()).await;

    assert_eq!(report.phase, IntentPhase::Converged);
    assert!(!report.retry);
    assert_eq!(outcome_labels(&report), vec!["Created"; 4]);
    assert_eq!(
        cluster.creates(),
        vec![
            (DependentKind::CredentialStore, "orders-credentials".to_string()),
            (DependentKind::StorageClaim, "orders-pvc".to_string()),
            (DependentKind::Workload, "orders".to_string()),
            (DependentKind::NetworkEndpoint, "orders-service".to_string()),
        ]
    );

    let Some(DependentObject::Workload(deployment)) = cluster.object(DependentKind::Workload, "orders")
    else {
        panic!("workload missing");
    };
    let spec = deployment.spec.unwrap();
    assert_eq!(spec.replicas, Some(2));
    assert_eq!(
        spec.template.spec.unwrap().containers[0].image.as_deref(),
        Some("mysql:8.0")
    );

    let Some(DependentObject::NetworkEndpoint(service)) =
        cluster.object(DependentKind::NetworkEndpoint, "orders-service")
    else {
        panic!("endpoint missing");
    };
    assert_eq!(service.spec.unwrap().ports.unwrap()[0].port, 3306);
}

#[tokio::test]
async fn redelivered_intent_is_a_no_op() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);
    let token = CancellationToken::new();

    reconcile(&ctx, &added("orders", "mysql", 2), &token).await;
    cluster.clear_calls();

    let modified = IntentEvent::new(ChangeKind::Modified, database("orders", "mysql", 2));
    let report = reconcile(&ctx, &modified, &token).await;

    assert_eq!(report.phase, IntentPhase::Converged);
    assert_eq!(outcome_labels(&report), vec!["AlreadyExists"; 4]);
    assert!(cluster.creates().is_empty());
    assert_eq!(cluster.object_count(), 4);
}

#[tokio::test]
async fn unsupported_engine_degrades_without_retry() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);

    let report = reconcile(&ctx, &added("legacy", "oracle", 1), &CancellationToken::new()).await;

    assert_eq!(report.phase, IntentPhase::Degraded);
    assert!(!report.retry);
    assert!(report.results.is_empty());
    assert!(report.message.contains("oracle"));
    assert!(cluster.calls().is_empty());
    assert_eq!(cluster.object_count(), 0);
}

#[tokio::test]
async fn transient_workload_failure_halts_and_resumes() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);
    let token = CancellationToken::new();
    cluster.fail_next_create(DependentKind::Workload, 503);

    let first = reconcile(&ctx, &added("orders", "mysql", 2), &token).await;

    assert_eq!(first.phase, IntentPhase::Degraded);
    assert!(first.retry);
    assert_eq!(outcome_labels(&first), vec!["Created", "Created", "TransientError"]);
    assert!(first.outcome(DependentKind::NetworkEndpoint).is_none());
    assert!(cluster
        .object(DependentKind::NetworkEndpoint, "orders-service")
        .is_none());

    cluster.clear_calls();
    let retry = IntentEvent::new(ChangeKind::Modified, database("orders", "mysql", 2));
    let second = reconcile(&ctx, &retry, &token).await;

    assert_eq!(second.phase, IntentPhase::Converged);
    assert_eq!(
        outcome_labels(&second),
        vec!["AlreadyExists", "AlreadyExists", "Created", "Created"]
    );
    assert_eq!(
        cluster.creates(),
        vec![
            (DependentKind::Workload, "orders".to_string()),
            (DependentKind::NetworkEndpoint, "orders-service".to_string()),
        ]
    );
}

#[tokio::test]
async fn fatal_apply_failure_is_not_retried() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);
    cluster.fail_next_create(DependentKind::StorageClaim, 422);

    let report = reconcile(&ctx, &added("orders", "mysql", 1), &CancellationToken::new()).await;

    assert_eq!(report.phase, IntentPhase::Degraded);
    assert!(!report.retry);
    assert!(matches!(
        report.outcome(DependentKind::StorageClaim),
        Some(ReconcileOutcome::FatalError(_))
    ));
    assert!(report.outcome(DependentKind::Workload).is_none());
}

#[tokio::test]
async fn mismatched_existing_workload_is_a_conflict() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);

    // Someone else's workload under the derived name, running another image.
    let mut objects = compose(&database("orders", "postgres", 1), &credentials()).unwrap();
    cluster.insert(objects.remove(2));

    let report = reconcile(&ctx, &added("orders", "mysql", 1), &CancellationToken::new()).await;

    assert_eq!(report.phase, IntentPhase::Degraded);
    assert!(report.retry);
    assert_eq!(outcome_labels(&report), vec!["Created", "Created", "Conflict"]);
    assert!(report.message.contains("image"));
}

#[tokio::test]
async fn replica_drift_is_reported_as_existing() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);
    let token = CancellationToken::new();

    reconcile(&ctx, &added("orders", "mysql", 2), &token).await;
    let scaled = IntentEvent::new(ChangeKind::Modified, database("orders", "mysql", 5));
    let report = reconcile(&ctx, &scaled, &token).await;

    assert_eq!(report.phase, IntentPhase::Converged);
    assert_eq!(outcome_labels(&report), vec!["AlreadyExists"; 4]);
}

#[tokio::test]
async fn creation_race_with_matching_object_counts_as_existing() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);
    let objects = compose(&database("orders", "mysql", 1), &credentials()).unwrap();
    cluster.race_next_create(objects[0].clone());

    let report = reconcile(&ctx, &added("orders", "mysql", 1), &CancellationToken::new()).await;

    assert_eq!(report.phase, IntentPhase::Converged);
    assert_eq!(
        outcome_labels(&report),
        vec!["AlreadyExists", "Created", "Created", "Created"]
    );
}

#[tokio::test]
async fn creation_race_with_foreign_object_is_a_conflict() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);
    let mut objects = compose(&database("orders", "mysql", 1), &credentials()).unwrap();
    let DependentObject::StorageClaim(mut claim) = objects.remove(1) else {
        panic!("expected storage claim");
    };
    claim
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(
            "app.kubernetes.io/managed-by".to_string(),
            "someone-else".to_string(),
        );
    cluster.race_next_create(DependentObject::StorageClaim(claim));

    let report = reconcile(&ctx, &added("orders", "mysql", 1), &CancellationToken::new()).await;

    assert_eq!(report.phase, IntentPhase::Degraded);
    assert!(report.retry);
    assert!(matches!(
        report.outcome(DependentKind::StorageClaim),
        Some(ReconcileOutcome::Conflict(m)) if m.contains("someone-else")
    ));
    assert!(report.outcome(DependentKind::Workload).is_none());
}

#[tokio::test]
async fn deleted_intent_is_tombstoned_without_calls() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);
    let deleted = IntentEvent::new(ChangeKind::Deleted, database("orders", "mysql", 1));

    let report = reconcile(&ctx, &deleted, &CancellationToken::new()).await;

    assert_eq!(report.phase, IntentPhase::Tombstoned);
    assert!(report.results.is_empty());
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn cancelled_reconcile_starts_no_apply() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);
    let token = CancellationToken::new();
    token.cancel();

    let report = reconcile(&ctx, &added("orders", "mysql", 1), &token).await;

    assert_eq!(report.phase, IntentPhase::Degraded);
    assert!(!report.retry);
    assert!(cluster.calls().is_empty());
}

#[tokio::test]
async fn applier_reads_before_creating() {
    let cluster = FakeCluster::new();
    let ctx = context(&cluster);

    reconcile(&ctx, &added("orders", "mysql", 1), &CancellationToken::new()).await;

    let calls = cluster.calls();
    assert_eq!(calls.len(), 8);
    assert_eq!(
        calls[0],
        Call::Get(DependentKind::CredentialStore, "orders-credentials".to_string())
    );
    assert_eq!(
        calls[1],
        Call::Create(DependentKind::CredentialStore, "orders-credentials".to_string())
    );
}
