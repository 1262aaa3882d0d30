//! Cluster access seams.
//!
//! The engine talks to the cluster only through these traits: a dynamic
//! repository for declarations (addressed by group-version-resource), a typed
//! repository for built-in workloads, and a sink for core Events. The
//! kube-backed implementations live here too; tests swap in in-memory fakes.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;

use crate::declaration::TargetResource;
use crate::error::{Error, Result};

/// Field manager recorded on declaration writes.
pub const FIELD_MANAGER: &str = "pre-hook";

/// Dynamic access to declarative resources by GVR.
#[async_trait]
pub trait DeclarationRepository: Send + Sync {
    async fn get(&self, target: &TargetResource, name: &str) -> Result<Option<DynamicObject>>;

    async fn list(&self, target: &TargetResource, label_selector: &str)
        -> Result<Vec<DynamicObject>>;

    async fn create(&self, target: &TargetResource, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn update(&self, target: &TargetResource, obj: &DynamicObject) -> Result<DynamicObject>;

    async fn delete(&self, target: &TargetResource, name: &str) -> Result<()>;

    /// Server-side watch filtered to one resource name. The stream yields the
    /// current object first and then every subsequent modification; it never
    /// terminates on its own for a live cluster.
    fn watch(&self, target: &TargetResource, name: &str)
        -> BoxStream<'static, Result<DynamicObject>>;
}

/// Typed access to the built-in workload kinds the synchronizer inspects.
#[async_trait]
pub trait WorkloadRepository: Send + Sync {
    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>>;
    async fn list_deployments(&self, label_selector: &str) -> Result<Vec<Deployment>>;
    async fn delete_deployment(&self, name: &str) -> Result<()>;
    async fn get_job(&self, name: &str) -> Result<Option<Job>>;
    async fn get_pod(&self, name: &str) -> Result<Option<Pod>>;
    async fn get_replica_set(&self, name: &str) -> Result<Option<ReplicaSet>>;
    async fn get_hpa(&self, name: &str) -> Result<Option<HorizontalPodAutoscaler>>;
    async fn delete_hpa(&self, name: &str) -> Result<()>;
}

/// Destination for correlated events. Kept on raw `kube::Result` because the
/// delivery loop classifies individual API error responses.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn create(&self, event: &Event) -> kube::Result<Event>;
    async fn patch(&self, name: &str, patch: &serde_json::Value) -> kube::Result<Event>;
}

/// Dynamic repository backed by the cluster API.
#[derive(Clone)]
pub struct KubeDeclarations {
    client: Client,
    namespace: String,
}

impl KubeDeclarations {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn api(&self, target: &TargetResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), &self.namespace, &target.api_resource())
    }
}

#[async_trait]
impl DeclarationRepository for KubeDeclarations {
    async fn get(&self, target: &TargetResource, name: &str) -> Result<Option<DynamicObject>> {
        Ok(self.api(target).get_opt(name).await?)
    }

    async fn list(
        &self,
        target: &TargetResource,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.api(target).list(&params).await?.items)
    }

    async fn create(&self, target: &TargetResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self.api(target).create(&params, obj).await?)
    }

    async fn update(&self, target: &TargetResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let name = obj
            .metadata
            .name
            .clone()
            .ok_or_else(|| Error::MissingField("metadata.name".to_string()))?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        Ok(self.api(target).replace(&name, &params, obj).await?)
    }

    async fn delete(&self, target: &TargetResource, name: &str) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        self.api(target).delete(name, &params).await?;
        Ok(())
    }

    fn watch(
        &self,
        target: &TargetResource,
        name: &str,
    ) -> BoxStream<'static, Result<DynamicObject>> {
        let config = watcher::Config::default().fields(&format!("metadata.name={name}"));
        watcher(self.api(target), config)
            .default_backoff()
            .applied_objects()
            .map_err(|e| Error::Watch(e.to_string()))
            .boxed()
    }
}

/// Typed workload repository backed by the cluster API.
#[derive(Clone)]
pub struct KubeWorkloads {
    client: Client,
    namespace: String,
}

impl KubeWorkloads {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
        K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

#[async_trait]
impl WorkloadRepository for KubeWorkloads {
    async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>> {
        Ok(self.api::<Deployment>().get_opt(name).await?)
    }

    async fn list_deployments(&self, label_selector: &str) -> Result<Vec<Deployment>> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.api::<Deployment>().list(&params).await?.items)
    }

    async fn delete_deployment(&self, name: &str) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        self.api::<Deployment>().delete(name, &params).await?;
        Ok(())
    }

    async fn get_job(&self, name: &str) -> Result<Option<Job>> {
        Ok(self.api::<Job>().get_opt(name).await?)
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>> {
        Ok(self.api::<Pod>().get_opt(name).await?)
    }

    async fn get_replica_set(&self, name: &str) -> Result<Option<ReplicaSet>> {
        Ok(self.api::<ReplicaSet>().get_opt(name).await?)
    }

    async fn get_hpa(&self, name: &str) -> Result<Option<HorizontalPodAutoscaler>> {
        Ok(self.api::<HorizontalPodAutoscaler>().get_opt(name).await?)
    }

    async fn delete_hpa(&self, name: &str) -> Result<()> {
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        self.api::<HorizontalPodAutoscaler>()
            .delete(name, &params)
            .await?;
        Ok(())
    }
}

/// Event sink writing to the core Event API in one namespace.
#[derive(Clone)]
pub struct KubeEventSink {
    api: Api<Event>,
}

impl KubeEventSink {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn create(&self, event: &Event) -> kube::Result<Event> {
        self.api.create(&PostParams::default(), event).await
    }

    async fn patch(&self, name: &str, patch: &serde_json::Value) -> kube::Result<Event> {
        self.api
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
    }
}
