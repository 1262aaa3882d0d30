//! Declaration reconciliation: create-or-update through the dynamic API.

use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::declaration::{inject_managed_by_label, TargetResource};
use crate::error::{Error, Result};
use crate::repository::DeclarationRepository;

/// Applies declaration manifests to the cluster, one GVR target at a time.
///
/// Every write is stamped with the managed-by label. Updates copy the live
/// object's resourceVersion so the server accepts the replace; losing a race
/// here surfaces as a conflict and aborts, because nothing else is expected
/// to write these objects during a deployment session.
#[derive(Clone)]
pub struct DeclarationReconciler {
    repo: Arc<dyn DeclarationRepository>,
}

impl DeclarationReconciler {
    pub fn new(repo: Arc<dyn DeclarationRepository>) -> Self {
        Self { repo }
    }

    /// Apply all declarations against one target. Returns the applied names
    /// in input order.
    pub async fn apply(
        &self,
        target: &TargetResource,
        declarations: &[DynamicObject],
    ) -> Result<Vec<String>> {
        let mut names = Vec::with_capacity(declarations.len());
        for declaration in declarations {
            names.push(self.apply_one(target, declaration).await?);
        }
        Ok(names)
    }

    async fn apply_one(&self, target: &TargetResource, declaration: &DynamicObject) -> Result<String> {
        let mut desired = declaration.clone();
        inject_managed_by_label(&mut desired);
        let name = desired
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::MissingField("metadata.name".to_string()))?;

        match self.repo.get(target, &name).await? {
            Some(existing) => {
                desired.metadata.resource_version = existing.resource_version();
                self.repo.update(target, &desired).await?;
                info!(target = %target, name = %name, "updated existing declaration");
            }
            None => {
                self.repo.create(target, &desired).await?;
                info!(target = %target, name = %name, "created declaration");
            }
        }
        debug!(target = %target, name = %name, "declaration applied");
        Ok(name)
    }
}
