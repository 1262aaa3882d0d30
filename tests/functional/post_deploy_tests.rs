//! Post-deploy behavior: session discovery, version migration, and the
//! gateway service applier.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use serde_json::json;

use cr_synchronizer::declaration::TargetResource;
use cr_synchronizer::generator::{GatewayServiceGenerator, Generator, GenericLabelGenerator};
use cr_synchronizer::migration::DeploymentMigration;
use cr_synchronizer::ownerref::OwnerRefReconciler;
use cr_synchronizer::waiter::DeclarationWaiter;

use crate::fakes::*;

fn build_waiter(
    repo: Arc<FakeRepository>,
    workloads: Arc<FakeWorkloads>,
) -> Arc<DeclarationWaiter> {
    let reporter = build_reporter(FakeSink::new(), workloads.clone());
    let ownerref = Arc::new(
        OwnerRefReconciler::new(repo.clone(), workloads, "orders", "orders-wait")
            .with_retry_policy(3, Duration::from_millis(1)),
    );
    Arc::new(DeclarationWaiter::new(repo, reporter, ownerref, Duration::from_secs(5)))
}

#[tokio::test]
async fn discovery_waits_for_session_declarations_by_label() {
    let repo = FakeRepository::new();
    let workloads = FakeWorkloads::new();
    workloads.put_deployment(labeled_deployment("orders", "orders", false));

    // The discovery target carries no kind; the plural stands in for it.
    let listing_target = TargetResource::new("core.qubership.org", "v1", "dbaases", "dbaases");
    let found = declaration("orders-db", json!({ "phase": "Updated" }));
    repo.put(&listing_target, found.clone());
    repo.script_list(&listing_target, vec![found.clone()]);
    repo.script_watch(&listing_target, "orders-db", vec![found]);

    let generator = GenericLabelGenerator::new(
        repo.clone(),
        build_waiter(repo.clone(), workloads.clone()),
        DeploymentMigration::new(workloads, "orders"),
        vec!["dbaases".to_string()],
        vec!["core.qubership.org".to_string()],
        vec!["cdn.qubership.org".to_string()],
        "session-1",
        "orders",
    );
    generator.generate().await.unwrap();

    let selectors = repo.list_selectors.lock().unwrap().clone();
    assert!(selectors.contains(
        &"deployment.qubership.org/sessionId=session-1,app.kubernetes.io/name=orders".to_string()
    ));
    assert!(selectors.contains(
        &"deployment.qubership.org/sessionId=session-1,app.kubernetes.io/instance=orders"
            .to_string()
    ));

    let stored = repo.get_stored(&listing_target, "orders-db").unwrap();
    assert_eq!(stored.owner_references().len(), 1, "discovered declaration gets owned");
}

#[tokio::test]
async fn discovery_waits_for_every_discovered_declaration() {
    let repo = FakeRepository::new();
    let workloads = FakeWorkloads::new();
    workloads.put_deployment(labeled_deployment("orders", "orders", false));

    let listing_target = TargetResource::new("core.qubership.org", "v1", "dbaases", "dbaases");
    let first = declaration("orders-db", json!({ "phase": "Updated" }));
    let second = declaration("orders-audit-db", json!({ "phase": "Updated" }));
    for decl in [&first, &second] {
        repo.put(&listing_target, decl.clone());
        repo.script_watch(&listing_target, &decl.name_any(), vec![decl.clone()]);
    }
    repo.script_list(&listing_target, vec![first, second]);

    let generator = GenericLabelGenerator::new(
        repo.clone(),
        build_waiter(repo.clone(), workloads.clone()),
        DeploymentMigration::new(workloads, "orders"),
        vec!["dbaases".to_string()],
        vec!["core.qubership.org".to_string()],
        vec!["cdn.qubership.org".to_string()],
        "session-1",
        "orders",
    );
    generator.generate().await.unwrap();

    for name in ["orders-db", "orders-audit-db"] {
        let stored = repo.get_stored(&listing_target, name).unwrap();
        assert_eq!(stored.owner_references().len(), 1, "declaration {name}");
    }
}

#[tokio::test]
async fn migration_replaces_old_deployment_and_autoscaler() {
    let workloads = FakeWorkloads::new();
    workloads.put_deployment(labeled_deployment("orders", "orders", false));
    workloads.put_deployment(labeled_deployment("orders-v1", "orders", true));
    workloads.put_deployment(labeled_deployment("orders-gateway", "orders", true));
    workloads.put_hpa("orders");

    let migration = DeploymentMigration::new(workloads.clone(), "orders")
        .with_wait_policy(Duration::from_secs(1), Duration::from_millis(10));
    migration.run().await.unwrap();

    assert_eq!(*workloads.deleted_deployments.lock().unwrap(), vec!["orders"]);
    assert_eq!(*workloads.deleted_hpas.lock().unwrap(), vec!["orders"]);
    assert!(workloads.deployments.lock().unwrap().contains_key("orders-v1"));
    assert!(workloads.deployments.lock().unwrap().contains_key("orders-gateway"));
}

#[tokio::test]
async fn migration_skips_operator_managed_deployments() {
    let workloads = FakeWorkloads::new();
    let mut old = labeled_deployment("orders", "orders", false);
    old.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(
            "app.kubernetes.io/managed-by-operator".to_string(),
            "facade-operator".to_string(),
        );
    workloads.put_deployment(old);
    workloads.put_deployment(labeled_deployment("orders-v1", "orders", true));

    let migration = DeploymentMigration::new(workloads.clone(), "orders");
    migration.run().await.unwrap();
    assert!(workloads.deleted_deployments.lock().unwrap().is_empty());
}

#[tokio::test]
async fn migration_without_v1_deployment_is_a_noop() {
    let workloads = FakeWorkloads::new();
    workloads.put_deployment(labeled_deployment("orders", "orders", true));
    workloads.put_hpa("orders");

    let migration = DeploymentMigration::new(workloads.clone(), "orders");
    migration.run().await.unwrap();
    assert!(workloads.deleted_deployments.lock().unwrap().is_empty());
    assert!(workloads.deleted_hpas.lock().unwrap().is_empty());
}

fn gateway_service(name: &str, gateway: &str, route: &str) -> kube::api::DynamicObject {
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "annotations": { "gateway.target": gateway, "gateway.route": route },
        },
        "spec": { "ports": [{ "port": 8080 }] },
    }))
    .unwrap()
}

fn gateway_targets() -> (TargetResource, TargetResource, TargetResource) {
    (
        TargetResource::new("gateway.networking.k8s.io", "v1", "gateways", "Gateway"),
        TargetResource::new("gateway.networking.k8s.io", "v1", "httproutes", "HTTPRoute"),
        TargetResource::new("", "v1", "services", "Service"),
    )
}

#[tokio::test]
async fn gateway_service_applied_when_gateway_and_route_exist() {
    let repo = FakeRepository::new();
    let (gateways, routes, services) = gateway_targets();

    repo.put(
        &gateways,
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": { "name": "mesh-gw" },
        }))
        .unwrap(),
    );
    repo.script_list(
        &routes,
        vec![serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "HTTPRoute",
            "metadata": { "name": "orders-route" },
            "spec": { "parentRefs": [{ "name": "mesh-gw" }] },
        }))
        .unwrap()],
    );

    let generator = GatewayServiceGenerator::new(
        repo.clone(),
        vec![gateway_service("orders-svc", "mesh-gw", "orders-route")],
        "apps",
        true,
    );
    generator.generate().await.unwrap();

    let stored = repo.get_stored(&services, "orders-svc").unwrap();
    assert_eq!(
        stored.labels().get("app.kubernetes.io/managed-by").map(String::as_str),
        Some("cr-synchronizer")
    );
}

#[tokio::test]
async fn gateway_service_skipped_when_route_missing_or_disabled() {
    let repo = FakeRepository::new();
    let (gateways, _, services) = gateway_targets();
    repo.put(
        &gateways,
        serde_json::from_value(json!({
            "apiVersion": "gateway.networking.k8s.io/v1",
            "kind": "Gateway",
            "metadata": { "name": "mesh-gw" },
        }))
        .unwrap(),
    );

    // Enabled, but no HTTPRoute references the gateway.
    let generator = GatewayServiceGenerator::new(
        repo.clone(),
        vec![gateway_service("orders-svc", "mesh-gw", "orders-route")],
        "apps",
        true,
    );
    generator.generate().await.unwrap();
    assert!(repo.get_stored(&services, "orders-svc").is_none());

    // Disabled: nothing is even looked up.
    let disabled = GatewayServiceGenerator::new(
        repo.clone(),
        vec![gateway_service("orders-svc", "mesh-gw", "orders-route")],
        "apps",
        false,
    );
    disabled.generate().await.unwrap();
    assert!(repo.get_stored(&services, "orders-svc").is_none());
}
