//! One-shot migration from pre-facade deployments.
//!
//! Services migrated to the facade topology run under a `<name>-v1`
//! deployment while the old `<name>` deployment lingers. Once the v1
//! deployment is available the old deployment and its autoscaler are removed.
//! Runs only in post-deploy mode, after all declarations settle.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::repository::WorkloadRepository;

const FACADE_OPERATOR_LABEL: &str = "app.kubernetes.io/managed-by-operator";
const FACADE_OPERATOR: &str = "facade-operator";
const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(300);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct DeploymentMigration {
    workloads: Arc<dyn WorkloadRepository>,
    service_name: String,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl DeploymentMigration {
    pub fn new(workloads: Arc<dyn WorkloadRepository>, service_name: &str) -> Self {
        Self {
            workloads,
            service_name: service_name.to_string(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the availability wait policy.
    pub fn with_wait_policy(mut self, ready_timeout: Duration, poll_interval: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self.poll_interval = poll_interval;
        self
    }

    pub async fn run(&self) -> Result<()> {
        info!(service = %self.service_name, "checking for deployment version migration");
        let selector = format!("app.kubernetes.io/name={}", self.service_name);
        let deployments = self.workloads.list_deployments(&selector).await?;

        // The list may also hold unrelated deployments sharing the name
        // label, so the pair is matched strictly on the `-v1` suffix.
        let Some((old, new)) = find_version_pair(&deployments) else {
            info!("no v1 deployment found, skipping deployment migration");
            return Ok(());
        };

        if old
            .labels()
            .get(FACADE_OPERATOR_LABEL)
            .is_some_and(|v| v == FACADE_OPERATOR)
        {
            info!(deployment = %old.name_any(), "old deployment is operator managed, skipping migration");
            return Ok(());
        }

        let new_name = new.name_any();
        self.wait_available(&new_name).await?;
        info!(deployment = %new_name, "v1 deployment is available");

        let old_name = old.name_any();
        info!(deployment = %old_name, "deleting old deployment");
        self.workloads.delete_deployment(&old_name).await?;

        self.remove_autoscaler().await
    }

    async fn wait_available(&self, name: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        loop {
            let deployment = self
                .workloads
                .get_deployment(name)
                .await?
                .ok_or_else(|| Error::MissingField(format!("deployment {name}")))?;
            if is_available(&deployment) {
                return Ok(());
            }
            debug!(deployment = %name, "v1 deployment not available yet");
            if tokio::time::Instant::now() + self.poll_interval > deadline {
                return Err(Error::WaitTimeout {
                    name: name.to_string(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// The old autoscaler is named after the service. Deletion is verified
    /// with a follow-up read so a failing delete surfaces here rather than as
    /// a scaling surprise later.
    async fn remove_autoscaler(&self) -> Result<()> {
        let Some(_) = self.workloads.get_hpa(&self.service_name).await? else {
            info!("no autoscaler found, migration finished");
            return Ok(());
        };
        info!(hpa = %self.service_name, "deleting old autoscaler");
        self.workloads.delete_hpa(&self.service_name).await?;
        if self.workloads.get_hpa(&self.service_name).await?.is_some() {
            debug!(hpa = %self.service_name, "autoscaler deletion still in progress");
        }
        info!("migration finished");
        Ok(())
    }
}

fn find_version_pair(deployments: &[Deployment]) -> Option<(&Deployment, &Deployment)> {
    for new in deployments {
        for old in deployments {
            if new.name_any() == format!("{}-v1", old.name_any()) {
                return Some((old, new));
            }
        }
    }
    None
}

fn is_available(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Available" && c.status == "True")
        })
        .unwrap_or(false)
}
