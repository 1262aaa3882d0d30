//! Create-or-update reconciliation and owner-reference conflict handling.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use serde_json::json;

use cr_synchronizer::declaration::TargetResource;
use cr_synchronizer::generator::{Generator, KnownKindGenerator};
use cr_synchronizer::ownerref::OwnerRefReconciler;
use cr_synchronizer::reconciler::DeclarationReconciler;
use cr_synchronizer::waiter::DeclarationWaiter;
use cr_synchronizer::Error;

use crate::fakes::*;

fn build_waiter(
    repo: Arc<FakeRepository>,
    workloads: Arc<FakeWorkloads>,
    timeout: Duration,
) -> Arc<DeclarationWaiter> {
    let sink = FakeSink::new();
    let reporter = build_reporter(sink, workloads.clone());
    let ownerref = Arc::new(
        OwnerRefReconciler::new(repo.clone(), workloads, "orders", "orders-wait")
            .with_retry_policy(3, Duration::from_millis(1)),
    );
    Arc::new(DeclarationWaiter::new(repo, reporter, ownerref, timeout))
}

#[tokio::test]
async fn first_apply_creates_second_updates_in_place() {
    let repo = FakeRepository::new();
    let target = dbaas_target();
    let reconciler = DeclarationReconciler::new(repo.clone());
    let desired = declaration("orders-db", json!({}));

    let names = reconciler.apply(&target, &[desired.clone()]).await.unwrap();
    assert_eq!(names, vec!["orders-db"]);
    assert_eq!(repo.create_count(), 1);
    assert_eq!(repo.update_count(), 0);

    let stored = repo.get_stored(&target, "orders-db").unwrap();
    assert_eq!(
        stored.labels().get("app.kubernetes.io/managed-by").map(String::as_str),
        Some("cr-synchronizer")
    );

    // Second apply must update, carrying the live resourceVersion.
    reconciler.apply(&target, &[desired]).await.unwrap();
    assert_eq!(repo.create_count(), 1);
    assert_eq!(repo.update_count(), 1);
    let sent = repo.updates.lock().unwrap().last().cloned().unwrap();
    assert_eq!(sent.resource_version().as_deref(), Some("1"));
}

#[tokio::test]
async fn known_kind_generator_applies_every_group_alias() {
    let repo = FakeRepository::new();
    let workloads = FakeWorkloads::new();
    workloads.put_deployment(labeled_deployment("orders", "orders", false));

    let groups = vec![
        "core.qubership.org".to_string(),
        "core.netcracker.com".to_string(),
    ];
    let updated = declaration("orders-db", json!({ "phase": "Updated" }));
    for group in &groups {
        let target = TargetResource::new(group, "v1", "dbaases", "DBaaS");
        repo.script_watch(&target, "orders-db", vec![updated.clone()]);
    }

    let generator = KnownKindGenerator::new(
        "DBaaS",
        "dbaases",
        groups.clone(),
        vec![declaration("orders-db", json!({}))],
        DeclarationReconciler::new(repo.clone()),
        build_waiter(repo.clone(), workloads, Duration::from_secs(5)),
    );
    generator.generate().await.unwrap();

    assert_eq!(repo.create_count(), 2);
    for group in &groups {
        let target = TargetResource::new(group, "v1", "dbaases", "DBaaS");
        let stored = repo.get_stored(&target, "orders-db").unwrap();
        assert_eq!(stored.owner_references().len(), 1, "group {group}");
        assert_eq!(stored.owner_references()[0].name, "orders");
    }
}

#[tokio::test]
async fn existing_owner_reference_is_left_untouched() {
    let repo = FakeRepository::new();
    let workloads = FakeWorkloads::new();
    workloads.put_deployment(labeled_deployment("orders", "orders", false));
    let target = dbaas_target();

    let mut owned = declaration("orders-db", json!({ "phase": "Updated" }));
    owned.metadata.owner_references = serde_json::from_value(json!([{
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "name": "orders",
        "uid": "uid-orders",
    }]))
    .unwrap();
    repo.put(&target, owned);

    let ownerref =
        OwnerRefReconciler::new(repo.clone(), workloads, "orders", "orders-wait");
    ownerref.ensure(&target, "orders-db").await.unwrap();
    assert_eq!(repo.update_count(), 0, "idempotent ensure must not write");
}

#[tokio::test]
async fn owner_reference_conflicts_are_retried_within_bound() {
    let repo = FakeRepository::new();
    let workloads = FakeWorkloads::new();
    workloads.put_deployment(labeled_deployment("orders", "orders", false));
    let target = dbaas_target();
    repo.put(&target, declaration("orders-db", json!({ "phase": "Updated" })));
    repo.fail_updates_with_conflict(&target, "orders-db", 2);

    let ownerref = OwnerRefReconciler::new(
        repo.clone(),
        workloads,
        "orders",
        "orders-wait",
    )
    .with_retry_policy(3, Duration::from_millis(1));
    ownerref.ensure(&target, "orders-db").await.unwrap();

    // Two conflicted writes plus the one that landed.
    assert_eq!(repo.update_count(), 3);
    let stored = repo.get_stored(&target, "orders-db").unwrap();
    assert_eq!(stored.owner_references().len(), 1);
}

#[tokio::test]
async fn owner_reference_retries_exhaust_after_bound() {
    let repo = FakeRepository::new();
    let workloads = FakeWorkloads::new();
    workloads.put_deployment(labeled_deployment("orders", "orders", false));
    let target = dbaas_target();
    repo.put(&target, declaration("orders-db", json!({ "phase": "Updated" })));
    repo.fail_updates_with_conflict(&target, "orders-db", 100);

    let ownerref = OwnerRefReconciler::new(
        repo.clone(),
        workloads,
        "orders",
        "orders-wait",
    )
    .with_retry_policy(3, Duration::from_millis(1));
    let err = ownerref.ensure(&target, "orders-db").await.unwrap_err();

    assert!(matches!(
        err,
        Error::ConflictRetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(repo.update_count(), 3, "exactly the bounded attempts");
}
