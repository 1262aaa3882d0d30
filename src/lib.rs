//! Deployment-time synchronizer for declarative custom resources.
//!
//! Runs as a deployment hook in two modes. The pre-deploy mode applies the
//! declaration manifests mounted into the pod and waits for their owning
//! controllers to settle them. The post-deploy mode discovers every
//! declaration created during this deployment session by label, waits for
//! those too, and finishes with the deployment version migration. Both modes
//! report terminal failures as Warning events on the deploying workload.

pub mod config;
pub mod declaration;
pub mod error;
pub mod events;
pub mod generator;
pub mod manifest;
pub mod migration;
pub mod ownerref;
pub mod reconciler;
pub mod repository;
pub mod waiter;

pub use config::SyncConfig;
pub use error::{Error, Result};

use std::sync::Arc;

use kube::Client;
use tracing::info;

use events::{resolve_receiver, CorrelatorOptions, EventCorrelator, EventReporter, SystemClock};
use generator::{
    GatewayServiceGenerator, GeneratorManager, GenericLabelGenerator, KnownKindGenerator,
};
use migration::DeploymentMigration;
use ownerref::OwnerRefReconciler;
use reconciler::DeclarationReconciler;
use repository::{
    DeclarationRepository, EventSink, KubeDeclarations, KubeEventSink, KubeWorkloads,
    WorkloadRepository,
};
use waiter::DeclarationWaiter;

/// Known declaration kinds applied from manifests during pre-deploy, with
/// the plural each is served under.
const KNOWN_KINDS: &[(&str, &str)] = &[("MaaS", "maases"), ("DBaaS", "dbaases")];

/// Run one synchronization pass against the cluster.
pub async fn run(client: Client, cfg: SyncConfig, post_deploy: bool) -> Result<()> {
    let repo: Arc<dyn DeclarationRepository> =
        Arc::new(KubeDeclarations::new(client.clone(), &cfg.namespace));
    let workloads: Arc<dyn WorkloadRepository> =
        Arc::new(KubeWorkloads::new(client.clone(), &cfg.namespace));
    let sink: Arc<dyn EventSink> = Arc::new(KubeEventSink::new(client, &cfg.namespace));

    let clock = Arc::new(SystemClock);
    let receiver = resolve_receiver(workloads.as_ref(), &cfg).await?;
    let pod_name = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    let correlator = EventCorrelator::new(CorrelatorOptions::default(), clock.clone());
    let reporter = Arc::new(EventReporter::new(
        sink,
        Arc::clone(&workloads),
        correlator,
        receiver,
        &cfg,
        pod_name,
        clock,
    ));

    let ownerref = Arc::new(OwnerRefReconciler::new(
        Arc::clone(&repo),
        Arc::clone(&workloads),
        &reporter.receiver().deployment_name,
        &cfg.wait_job_name,
    ));
    let waiter = Arc::new(DeclarationWaiter::new(
        Arc::clone(&repo),
        Arc::clone(&reporter),
        ownerref,
        cfg.wait_timeout,
    ));

    let mut manager = GeneratorManager::new();
    if post_deploy {
        info!(mode = "finalizer", "post-deploy hook started");
        let migration = DeploymentMigration::new(Arc::clone(&workloads), &cfg.service_name);
        manager.register(Arc::new(GenericLabelGenerator::new(
            Arc::clone(&repo),
            waiter,
            migration,
            cfg.declaration_plurals.clone(),
            cfg.core_api_groups.clone(),
            cfg.cdn_api_groups.clone(),
            &cfg.deployment_session_id,
            &cfg.service_name,
        )));
    } else {
        info!(mode = "synchronizer", "pre-deploy hook started");
        let mut by_kind = manifest::load_declarations(&cfg.declarations_dir)?;
        let reconciler = DeclarationReconciler::new(Arc::clone(&repo));
        for (kind, plural) in KNOWN_KINDS {
            manager.register(Arc::new(KnownKindGenerator::new(
                kind,
                plural,
                cfg.core_api_groups.clone(),
                by_kind.remove(*kind).unwrap_or_default(),
                reconciler.clone(),
                Arc::clone(&waiter),
            )));
        }
        manager.register(Arc::new(GatewayServiceGenerator::new(
            repo,
            by_kind.remove("Service").unwrap_or_default(),
            &cfg.namespace,
            cfg.istio_integration,
        )));
    }
    manager.run_all().await
}
