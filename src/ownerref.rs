//! Owner-reference stamping for successfully applied declarations.
//!
//! Once a declaration reaches its terminal success phase it is tied to the
//! deploying workload with an owner reference, so deleting the workload
//! garbage-collects the declaration. Writes race the owning controller's own
//! status updates, so conflicts are absorbed with a bounded re-fetch loop.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::declaration::{has_owner_reference, TargetResource};
use crate::error::{Error, Result};
use crate::repository::{DeclarationRepository, WorkloadRepository};

const DEFAULT_CONFLICT_ATTEMPTS: u32 = 10;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

pub struct OwnerRefReconciler {
    repo: Arc<dyn DeclarationRepository>,
    workloads: Arc<dyn WorkloadRepository>,
    deployment_name: String,
    wait_job_name: String,
    attempts: u32,
    retry_delay: Duration,
}

impl OwnerRefReconciler {
    pub fn new(
        repo: Arc<dyn DeclarationRepository>,
        workloads: Arc<dyn WorkloadRepository>,
        deployment_name: &str,
        wait_job_name: &str,
    ) -> Self {
        Self {
            repo,
            workloads,
            deployment_name: deployment_name.to_string(),
            wait_job_name: wait_job_name.to_string(),
            attempts: DEFAULT_CONFLICT_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Override the conflict retry policy.
    pub fn with_retry_policy(mut self, attempts: u32, retry_delay: Duration) -> Self {
        self.attempts = attempts;
        self.retry_delay = retry_delay;
        self
    }

    /// Stamp the owner reference onto one declaration. Idempotent: an object
    /// that already carries any owner reference is left untouched.
    pub async fn ensure(&self, target: &TargetResource, name: &str) -> Result<()> {
        let Some(current) = self.repo.get(target, name).await? else {
            warn!(target = %target, name = %name, "declaration vanished before owner reference could be set");
            return Ok(());
        };
        if has_owner_reference(&current) {
            debug!(target = %target, name = %name, "owner reference already present");
            return Ok(());
        }

        let Some(owner) = self.resolve_owner().await? else {
            warn!(
                deployment = %self.deployment_name,
                job = %self.wait_job_name,
                "no owning workload found, leaving declaration unowned"
            );
            return Ok(());
        };

        for attempt in 1..=self.attempts {
            let Some(mut fresh) = self.repo.get(target, name).await? else {
                warn!(target = %target, name = %name, "declaration vanished during owner reference update");
                return Ok(());
            };
            if has_owner_reference(&fresh) {
                return Ok(());
            }
            fresh.metadata.owner_references = Some(vec![owner.clone()]);
            match self.repo.update(target, &fresh).await {
                Ok(_) => {
                    info!(target = %target, name = %name, owner = %owner.name, "owner reference set");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(target = %target, name = %name, attempt, "conflict setting owner reference, retrying");
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::ConflictRetriesExhausted {
            name: name.to_string(),
            attempts: self.attempts,
        })
    }

    /// The deployment named in the environment owns declarations when it
    /// exists; first installations fall back to the wait job.
    async fn resolve_owner(&self) -> Result<Option<OwnerReference>> {
        if !self.deployment_name.is_empty() {
            if let Some(deployment) = self.workloads.get_deployment(&self.deployment_name).await? {
                return Ok(Some(OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: "Deployment".to_string(),
                    name: deployment.name_any(),
                    uid: deployment.metadata.uid.clone().unwrap_or_default(),
                    ..Default::default()
                }));
            }
        }
        if let Some(job) = self.workloads.get_job(&self.wait_job_name).await? {
            return Ok(Some(OwnerReference {
                api_version: "batch/v1".to_string(),
                kind: "Job".to_string(),
                name: job.name_any(),
                uid: job.metadata.uid.clone().unwrap_or_default(),
                ..Default::default()
            }));
        }
        Ok(None)
    }
}
