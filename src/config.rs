//! Process configuration.
//!
//! One `SyncConfig` is built from the environment at startup and passed by
//! reference into every component. Its lifetime is exactly one invocation,
//! so there is no package-level mutable state to reset between tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Label stamped on every reconciled resource.
pub const MANAGED_BY: &str = "cr-synchronizer";

/// Component name reported as the event source.
pub const EVENT_SOURCE_COMPONENT: &str = "nc-operator";

/// Host/instance reported alongside the event source component.
pub const EVENT_SOURCE_INSTANCE: &str = "declaration-waiter";

/// Operator identity recorded in the processed-by label.
pub const PROCESSED_BY: &str = "core-operator";

/// Default wall-clock timeout for one declaration wait.
pub const DEFAULT_WAIT_TIMEOUT_SECS: u64 = 300;

/// Default mount point for declaration manifests.
const DEFAULT_DECLARATIONS_DIR: &str = "/declarations";

/// Plurals checked during post-deploy discovery when no override is set.
const DEFAULT_PLURALS: &[&str] = &[
    "configurationpackages",
    "smartplugplugins",
    "meshes",
    "securities",
    "composites",
    "maases",
    "dbaases",
    "gateways",
];

const DEFAULT_CORE_GROUP: &str = "core.qubership.org";
const DEFAULT_CDN_GROUP: &str = "cdn.qubership.org";

/// Immutable per-invocation configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub namespace: String,
    pub service_name: String,
    pub application_name: String,
    pub deployment_session_id: String,
    pub deployment_resource_name: String,
    pub wait_job_name: String,
    /// Wall-clock timeout for each phase wait.
    pub wait_timeout: Duration,
    /// Resource plurals checked during post-deploy discovery.
    pub declaration_plurals: Vec<String>,
    /// API group aliases the reconciler must apply, in order.
    pub core_api_groups: Vec<String>,
    /// API group aliases for CDN resources.
    pub cdn_api_groups: Vec<String>,
    /// Mounted directory holding declaration manifests (pre-deploy).
    pub declarations_dir: PathBuf,
    /// Whether the gateway service generator is enabled.
    pub istio_integration: bool,
}

impl SyncConfig {
    /// Build the configuration from process environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary lookup function.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let namespace = lookup("POD_NAMESPACE")
            .filter(|ns| !ns.is_empty())
            .or_else(namespace_from_service_account)
            .unwrap_or_else(|| "default".to_string());

        let wait_timeout = lookup("RESOURCE_POLLING_TIMEOUT")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_WAIT_TIMEOUT_SECS));

        let declaration_plurals = match lookup("DECLARATIONS_PLURALS") {
            Some(list) if !list.is_empty() => split_csv(&list),
            _ => DEFAULT_PLURALS.iter().map(|s| s.to_string()).collect(),
        };

        let core_api_groups = lookup("K8S_CORE_API_GROUP_NAMES")
            .filter(|v| !v.is_empty())
            .map(|v| split_csv(&v))
            .unwrap_or_else(|| vec![DEFAULT_CORE_GROUP.to_string()]);

        let cdn_api_groups = lookup("K8S_CDN_API_GROUP_NAMES")
            .filter(|v| !v.is_empty())
            .map(|v| split_csv(&v))
            .unwrap_or_else(|| vec![DEFAULT_CDN_GROUP.to_string()]);

        let istio_integration = lookup("ISTIO_INTEGRATION")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Self {
            namespace,
            service_name: lookup("SERVICE_NAME").unwrap_or_default(),
            application_name: lookup("APPLICATION_NAME").unwrap_or_default(),
            deployment_session_id: lookup("DEPLOYMENT_SESSION_ID").unwrap_or_default(),
            deployment_resource_name: lookup("DEPLOYMENT_RESOURCE_NAME").unwrap_or_default(),
            wait_job_name: lookup("WAIT_JOB_NAME").unwrap_or_default(),
            wait_timeout,
            declaration_plurals,
            core_api_groups,
            cdn_api_groups,
            declarations_dir: lookup("DECLARATIONS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DECLARATIONS_DIR)),
            istio_integration,
        }
    }

    /// Session labels stamped on emitted events.
    pub fn session_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (
                "deployment.qubership.org/sessionId".to_string(),
                self.deployment_session_id.clone(),
            ),
            (
                "app.kubernetes.io/name".to_string(),
                self.service_name.clone(),
            ),
            (
                "app.kubernetes.io/managed-by".to_string(),
                MANAGED_BY.to_string(),
            ),
            (
                "app.kubernetes.io/part-of".to_string(),
                self.application_name.clone(),
            ),
            (
                "app.kubernetes.io/processed-by-operator".to_string(),
                PROCESSED_BY.to_string(),
            ),
        ])
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn namespace_from_service_account() -> Option<String> {
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .ok()
        .map(|ns| ns.trim().to_string())
        .filter(|ns| !ns.is_empty())
}
