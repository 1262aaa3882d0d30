//! Generators: the units of work one synchronizer run is composed of.
//!
//! Pre-deploy runs register one generator per known declaration kind; the
//! post-deploy run registers the label-driven discovery generator and, when
//! the mesh integration is enabled, the gateway service applier. The manager
//! runs all registered generators concurrently and fails fast.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::ResourceExt;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::declaration::{inject_managed_by_label, TargetResource};
use crate::error::{Error, Result};
use crate::migration::DeploymentMigration;
use crate::reconciler::DeclarationReconciler;
use crate::repository::DeclarationRepository;
use crate::waiter::DeclarationWaiter;

/// Declaration API version shared by all synchronized groups.
const DECLARATION_VERSION: &str = "v1";

const GATEWAY_API_GROUP: &str = "gateway.networking.k8s.io";
const GATEWAY_TARGET_ANNOTATION: &str = "gateway.target";
const GATEWAY_ROUTE_ANNOTATION: &str = "gateway.route";

/// One independent unit of synchronization work.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self) -> Result<()>;
}

/// Name-keyed generator registry. Registering under an existing name
/// replaces the previous generator.
#[derive(Default)]
pub struct GeneratorManager {
    generators: HashMap<String, Arc<dyn Generator>>,
}

impl GeneratorManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, generator: Arc<dyn Generator>) {
        self.generators
            .insert(generator.name().to_string(), generator);
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    /// Run every registered generator concurrently. The first failure aborts
    /// the remaining generators and is returned.
    pub async fn run_all(&self) -> Result<()> {
        let mut tasks = JoinSet::new();
        for generator in self.generators.values() {
            let generator = Arc::clone(generator);
            tasks.spawn(async move {
                let name = generator.name().to_string();
                (name, generator.generate().await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(()))) => info!(generator = %name, "generator finished"),
                Ok((name, Err(e))) => {
                    warn!(generator = %name, error = %e, "generator failed, aborting the rest");
                    tasks.abort_all();
                    return Err(e);
                }
                Err(join_err) => {
                    tasks.abort_all();
                    return Err(Error::TaskJoin(join_err.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Pre-deploy generator for one known declaration kind: applies the mounted
/// manifests to every configured group alias, then waits for all of them.
pub struct KnownKindGenerator {
    kind: String,
    plural: String,
    groups: Vec<String>,
    declarations: Vec<DynamicObject>,
    reconciler: DeclarationReconciler,
    waiter: Arc<DeclarationWaiter>,
}

impl KnownKindGenerator {
    pub fn new(
        kind: &str,
        plural: &str,
        groups: Vec<String>,
        declarations: Vec<DynamicObject>,
        reconciler: DeclarationReconciler,
        waiter: Arc<DeclarationWaiter>,
    ) -> Self {
        Self {
            kind: kind.to_string(),
            plural: plural.to_string(),
            groups,
            declarations,
            reconciler,
            waiter,
        }
    }
}

#[async_trait]
impl Generator for KnownKindGenerator {
    fn name(&self) -> &str {
        &self.plural
    }

    async fn generate(&self) -> Result<()> {
        if self.declarations.is_empty() {
            debug!(kind = %self.kind, "no declarations of this kind, nothing to do");
            return Ok(());
        }

        let mut applied: Vec<(TargetResource, String)> = Vec::new();
        for group in &self.groups {
            let target = TargetResource::new(group, DECLARATION_VERSION, &self.plural, &self.kind);
            let names = self.reconciler.apply(&target, &self.declarations).await?;
            applied.extend(names.into_iter().map(|name| (target.clone(), name)));
        }

        let mut waits = JoinSet::new();
        for (target, name) in applied {
            let waiter = Arc::clone(&self.waiter);
            waits.spawn(async move { waiter.wait_ready(&target, &name).await });
        }
        while let Some(joined) = waits.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    waits.abort_all();
                    return Err(e);
                }
                Err(join_err) => {
                    waits.abort_all();
                    return Err(Error::TaskJoin(join_err.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Post-deploy generator: discovers declarations created during this
/// deployment session by label and waits for each, then runs the deployment
/// version migration.
pub struct GenericLabelGenerator {
    repo: Arc<dyn DeclarationRepository>,
    waiter: Arc<DeclarationWaiter>,
    migration: DeploymentMigration,
    plurals: Vec<String>,
    core_groups: Vec<String>,
    cdn_groups: Vec<String>,
    session_id: String,
    service_name: String,
}

impl GenericLabelGenerator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn DeclarationRepository>,
        waiter: Arc<DeclarationWaiter>,
        migration: DeploymentMigration,
        plurals: Vec<String>,
        core_groups: Vec<String>,
        cdn_groups: Vec<String>,
        session_id: &str,
        service_name: &str,
    ) -> Self {
        Self {
            repo,
            waiter,
            migration,
            plurals,
            core_groups,
            cdn_groups,
            session_id: session_id.to_string(),
            service_name: service_name.to_string(),
        }
    }

    async fn process_label(&self, target: &TargetResource, label_key: &str) -> Result<()> {
        let selector = format!(
            "deployment.qubership.org/sessionId={},{}={}",
            self.session_id, label_key, self.service_name
        );
        info!(target = %target, selector = %selector, "checking for declarations to wait for");
        let declarations = match self.repo.list(target, &selector).await {
            Ok(list) => list,
            Err(e) => {
                // The plural may not be served by this cluster at all.
                warn!(target = %target, error = %e, "failed to list declarations for session");
                return Ok(());
            }
        };
        let mut waits = JoinSet::new();
        for declaration in declarations {
            let name = declaration.name_any();
            // The listing target carries no kind; take it from the object.
            let mut resolved = target.clone();
            if let Some(types) = &declaration.types {
                if !types.kind.is_empty() {
                    resolved.kind = types.kind.clone();
                }
            }
            let waiter = Arc::clone(&self.waiter);
            waits.spawn(async move { waiter.wait_ready(&resolved, &name).await });
        }
        while let Some(joined) = waits.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    waits.abort_all();
                    return Err(e);
                }
                Err(join_err) => {
                    waits.abort_all();
                    return Err(Error::TaskJoin(join_err.to_string()));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Generator for GenericLabelGenerator {
    fn name(&self) -> &str {
        "genericDeclarativeClient"
    }

    async fn generate(&self) -> Result<()> {
        for plural in &self.plurals {
            let groups = if plural.eq_ignore_ascii_case("cdns") {
                &self.cdn_groups
            } else {
                &self.core_groups
            };
            for group in groups {
                let target = TargetResource::new(group, DECLARATION_VERSION, plural, plural);
                self.process_label(&target, "app.kubernetes.io/name").await?;
                self.process_label(&target, "app.kubernetes.io/instance")
                    .await?;
            }
        }
        self.migration.run().await
    }
}

/// Applies Service manifests once their Gateway and a referencing HTTPRoute
/// exist. Every failure here is soft: mesh wiring must not block the
/// deployment itself.
pub struct GatewayServiceGenerator {
    repo: Arc<dyn DeclarationRepository>,
    services: Vec<DynamicObject>,
    namespace: String,
    enabled: bool,
}

impl GatewayServiceGenerator {
    pub fn new(
        repo: Arc<dyn DeclarationRepository>,
        services: Vec<DynamicObject>,
        namespace: &str,
        enabled: bool,
    ) -> Self {
        Self {
            repo,
            services,
            namespace: namespace.to_string(),
            enabled,
        }
    }

    async fn gateway_and_route_present(&self, gateway: &str, route: &str) -> Result<bool> {
        let gateway_target =
            TargetResource::new(GATEWAY_API_GROUP, "v1", "gateways", "Gateway");
        if self.repo.get(&gateway_target, gateway).await?.is_none() {
            return Ok(false);
        }

        let route_target =
            TargetResource::new(GATEWAY_API_GROUP, "v1", "httproutes", "HTTPRoute");
        let routes = self.repo.list(&route_target, "").await?;
        Ok(routes
            .iter()
            .filter(|r| r.name_any() == route)
            .any(|r| route_references_gateway(r, gateway, &self.namespace)))
    }

    async fn apply_service(&self, service: &DynamicObject) -> Result<()> {
        let target = TargetResource::new("", "v1", "services", "Service");
        let mut desired = service.clone();
        inject_managed_by_label(&mut desired);
        let name = desired.name_any();

        if self.repo.get(&target, &name).await?.is_some() {
            desired.metadata.resource_version = None;
            self.repo.update(&target, &desired).await?;
            info!(service = %name, "gateway service updated");
        } else {
            self.repo.create(&target, &desired).await?;
            info!(service = %name, "gateway service created");
        }
        Ok(())
    }
}

#[async_trait]
impl Generator for GatewayServiceGenerator {
    fn name(&self) -> &str {
        "gatewayServiceApplier"
    }

    async fn generate(&self) -> Result<()> {
        if !self.enabled {
            info!("mesh integration not enabled, skipping gateway service application");
            return Ok(());
        }
        if self.services.is_empty() {
            info!("no Service objects provided in declarations, skipping");
            return Ok(());
        }

        for service in &self.services {
            let name = service.name_any();
            let annotations = service.annotations();
            let gateway = annotations
                .get(GATEWAY_TARGET_ANNOTATION)
                .map(|v| v.trim())
                .unwrap_or_default();
            let route = annotations
                .get(GATEWAY_ROUTE_ANNOTATION)
                .map(|v| v.trim())
                .unwrap_or_default();
            if gateway.is_empty() || route.is_empty() {
                info!(service = %name, "gateway annotations missing, skipping");
                continue;
            }

            match self.gateway_and_route_present(gateway, route).await {
                Ok(true) => {}
                Ok(false) => {
                    info!(service = %name, gateway = %gateway, route = %route, "gateway or route not available, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(service = %name, error = %e, "error checking gateway availability, skipping");
                    continue;
                }
            }

            if let Err(e) = self.apply_service(service).await {
                warn!(service = %name, error = %e, "failed to apply gateway service");
            }
        }
        Ok(())
    }
}

/// Whether an HTTPRoute lists the gateway among its parent refs. A parent
/// ref without a namespace refers to the route's own namespace.
fn route_references_gateway(route: &DynamicObject, gateway: &str, namespace: &str) -> bool {
    route
        .data
        .get("spec")
        .and_then(|s| s.get("parentRefs"))
        .and_then(|p| p.as_array())
        .map(|refs| {
            refs.iter().any(|r| {
                r.get("name").and_then(|n| n.as_str()) == Some(gateway)
                    && r.get("namespace")
                        .and_then(|ns| ns.as_str())
                        .map_or(true, |ns| ns == namespace)
            })
        })
        .unwrap_or(false)
}
