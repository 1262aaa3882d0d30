//! End-to-end waits: success, terminal failure, and timeout.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use serde_json::json;

use cr_synchronizer::ownerref::OwnerRefReconciler;
use cr_synchronizer::waiter::DeclarationWaiter;
use cr_synchronizer::Error;

use crate::fakes::*;

struct WaitHarness {
    repo: Arc<FakeRepository>,
    sink: Arc<FakeSink>,
    waiter: DeclarationWaiter,
}

fn harness(timeout: Duration) -> WaitHarness {
    let repo = FakeRepository::new();
    let workloads = FakeWorkloads::new();
    workloads.put_deployment(labeled_deployment("orders", "orders", false));
    let sink = FakeSink::new();
    let reporter = build_reporter(sink.clone(), workloads.clone());
    let ownerref = Arc::new(
        OwnerRefReconciler::new(repo.clone(), workloads, "orders", "orders-wait")
            .with_retry_policy(3, Duration::from_millis(1)),
    );
    let waiter = DeclarationWaiter::new(repo.clone(), reporter, ownerref, timeout);
    WaitHarness { repo, sink, waiter }
}

#[tokio::test]
async fn declaration_reaches_updated_and_gets_owner_reference() {
    let h = harness(Duration::from_secs(5));
    let target = dbaas_target();
    h.repo.put(&target, declaration("orders-db", json!({ "phase": "Updating" })));
    h.repo.script_watch(
        &target,
        "orders-db",
        vec![
            declaration("orders-db", json!({ "phase": "Updating" })),
            declaration("orders-db", json!({ "phase": "Updated" })),
        ],
    );

    h.waiter.wait_ready(&target, "orders-db").await.unwrap();

    let stored = h.repo.get_stored(&target, "orders-db").unwrap();
    assert_eq!(stored.owner_references().len(), 1);
    assert_eq!(stored.owner_references()[0].kind, "Deployment");
    assert_eq!(h.repo.update_count(), 1, "owner reference written exactly once");
    assert_eq!(h.sink.created_count(), 0, "success produces no events");
}

#[tokio::test]
async fn transient_watch_errors_do_not_abort_the_wait() {
    let h = harness(Duration::from_secs(5));
    let target = dbaas_target();
    h.repo.put(&target, declaration("orders-db", json!({ "phase": "Updating" })));
    h.repo.script_watch_steps(
        &target,
        "orders-db",
        vec![
            Err("watch connection reset".to_string()),
            Ok(declaration("orders-db", json!({ "phase": "Updated" }))),
        ],
    );

    // The error is logged and the wait continues to the terminal phase.
    h.waiter.wait_ready(&target, "orders-db").await.unwrap();
    let stored = h.repo.get_stored(&target, "orders-db").unwrap();
    assert_eq!(stored.owner_references().len(), 1);
    assert_eq!(h.sink.created_count(), 0);
}

#[tokio::test]
async fn invalid_configuration_reports_one_warning_and_fails() {
    let h = harness(Duration::from_secs(5));
    let target = dbaas_target();
    h.repo.script_watch(
        &target,
        "orders-db",
        vec![declaration(
            "orders-db",
            json!({
                "phase": "InvalidConfiguration",
                "reason": "SchemaError",
                "message": "spec.classifier is malformed"
            }),
        )],
    );

    let err = h.waiter.wait_ready(&target, "orders-db").await.unwrap_err();
    assert!(matches!(err, Error::DeclarationFailed { .. }));
    assert!(err.is_fatal());

    assert_eq!(h.sink.created_reasons(), vec!["SchemaError"]);
    let event = h.sink.created.lock().unwrap()[0].clone();
    assert_eq!(event.type_.as_deref(), Some("Warning"));
    assert_eq!(event.message.as_deref(), Some("spec.classifier is malformed"));
    let annotations = event.metadata.annotations.unwrap();
    assert_eq!(annotations.get("relatedCR").map(String::as_str), Some("DBaaS/orders-db"));
    assert_eq!(
        annotations.get("relatedToRuntimeObject").map(String::as_str),
        Some("Deployment/orders")
    );
    assert_eq!(
        event.involved_object.name.as_deref(),
        Some("orders"),
        "event attaches to the deploying workload, not the declaration"
    );

    assert!(
        h.repo.get_stored(&target, "orders-db").is_none() || h.repo.update_count() == 0,
        "failure must not stamp owner references"
    );
}

#[tokio::test]
async fn wall_clock_timeout_reports_warning_and_fails() {
    let h = harness(Duration::from_millis(50));
    let target = dbaas_target();
    // Never reaches a terminal phase.
    h.repo.script_watch(
        &target,
        "orders-db",
        vec![declaration("orders-db", json!({ "phase": "Updating" }))],
    );

    let err = h.waiter.wait_ready(&target, "orders-db").await.unwrap_err();
    assert!(matches!(err, Error::WaitTimeout { .. }));
    assert!(err.is_fatal());
    assert_eq!(h.sink.created_reasons(), vec!["TimeOutReached"]);
    assert_eq!(h.repo.update_count(), 0);
}

#[tokio::test]
async fn transient_phases_do_not_terminate_the_wait() {
    let h = harness(Duration::from_millis(50));
    let target = dbaas_target();
    h.repo.script_watch(
        &target,
        "orders-db",
        vec![
            declaration("orders-db", json!({})),
            declaration("orders-db", json!({ "phase": "WaitingForDependency" })),
            declaration("orders-db", json!({ "phase": "BackingOff" })),
            declaration("orders-db", json!({ "phase": "Provisioning" })),
        ],
    );

    // All observations are non-terminal, so only the deadline can end this.
    let err = h.waiter.wait_ready(&target, "orders-db").await.unwrap_err();
    assert!(matches!(err, Error::WaitTimeout { .. }));
}
