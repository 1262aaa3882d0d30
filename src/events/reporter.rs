//! Event construction and delivery.
//!
//! Terminal declaration failures are reported as Warning events attached to
//! the deploying workload so operators see them in `kubectl describe` without
//! reading logs. Events pass through the correlator before delivery and are
//! written with bounded, jittered retries. Delivery failures are never fatal:
//! losing a diagnostic event must not abort a deployment.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use crate::config::{SyncConfig, EVENT_SOURCE_COMPONENT, EVENT_SOURCE_INSTANCE};
use crate::error::{Error, Result};
use crate::events::correlator::{Clock, CorrelateResult, EventCorrelator};
use crate::repository::{EventSink, WorkloadRepository};

const DEFAULT_MAX_TRIES: u32 = 12;
const DEFAULT_RETRY_SLEEP: Duration = Duration::from_secs(10);

/// Kind of workload that receives emitted events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverKind {
    Deployment,
    Job,
}

impl ReceiverKind {
    fn as_str(&self) -> &'static str {
        match self {
            ReceiverKind::Deployment => "Deployment",
            ReceiverKind::Job => "Job",
        }
    }
}

/// The workload events are attached to, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Receiver {
    pub kind: ReceiverKind,
    pub name: String,
    pub uid: Option<String>,
    pub resource_version: Option<String>,
    /// Deployment name used for owner-reference stamping. Falls back to the
    /// configured name when no deployment existed at resolution time.
    pub deployment_name: String,
}

/// Resolve the runtime object that receives events: the deployment named by
/// `DEPLOYMENT_RESOURCE_NAME`, then `SERVICE_NAME`, then the wait job.
pub async fn resolve_receiver(
    workloads: &dyn WorkloadRepository,
    cfg: &SyncConfig,
) -> Result<Receiver> {
    for name in [&cfg.deployment_resource_name, &cfg.service_name] {
        if name.is_empty() {
            continue;
        }
        if let Some(deployment) = workloads.get_deployment(name).await? {
            info!(kind = "Deployment", name = %name, "resolved runtime object to receive events");
            return Ok(Receiver {
                kind: ReceiverKind::Deployment,
                name: deployment.name_any(),
                uid: deployment.metadata.uid.clone(),
                resource_version: deployment.metadata.resource_version.clone(),
                deployment_name: deployment.name_any(),
            });
        }
    }

    let job = workloads
        .get_job(&cfg.wait_job_name)
        .await?
        .ok_or_else(|| Error::MissingField("runtime object to send events".to_string()))?;

    let deployment_name = if !cfg.deployment_resource_name.is_empty() {
        warn!("DEPLOYMENT_RESOURCE_NAME used as deployment name, but it does not exist in the previous installation");
        cfg.deployment_resource_name.clone()
    } else {
        warn!("SERVICE_NAME used as deployment name, but it does not exist in the previous installation");
        cfg.service_name.clone()
    };
    info!(kind = "Job", name = %job.name_any(), "resolved runtime object to receive events");
    Ok(Receiver {
        kind: ReceiverKind::Job,
        name: job.name_any(),
        uid: job.metadata.uid.clone(),
        resource_version: job.metadata.resource_version.clone(),
        deployment_name,
    })
}

/// Workload identity of this pod's owner, for the traceability annotations.
#[derive(Debug, Clone, Default)]
struct Producer {
    kind: String,
    name: String,
    uid: String,
}

async fn resolve_producer(workloads: &dyn WorkloadRepository, pod_name: &str) -> Producer {
    let pod = match workloads.get_pod(pod_name).await {
        Ok(Some(pod)) => pod,
        Ok(None) => {
            warn!(pod = %pod_name, "pod not found in current namespace, producer annotations left empty");
            return Producer::default();
        }
        Err(e) => {
            warn!(pod = %pod_name, error = %e, "failed to fetch pod, producer annotations left empty");
            return Producer::default();
        }
    };

    let Some(owner) = pod.owner_references().first().cloned() else {
        return Producer::default();
    };

    match owner.kind.as_str() {
        "ReplicaSet" => match workloads.get_replica_set(&owner.name).await {
            Ok(Some(rs)) => match rs.owner_references().first() {
                Some(rs_owner) => Producer {
                    kind: "Deployment".to_string(),
                    name: rs_owner.name.clone(),
                    uid: rs_owner.uid.clone(),
                },
                None => Producer::default(),
            },
            _ => {
                warn!(replicaset = %owner.name, "failed to resolve owning replica set");
                Producer::default()
            }
        },
        "DaemonSet" | "StatefulSet" | "Job" => Producer {
            kind: owner.kind.clone(),
            name: owner.name.clone(),
            uid: owner.uid.clone(),
        },
        other => {
            warn!(kind = %other, "could not find resource manager for pod");
            Producer::default()
        }
    }
}

/// Builds, correlates, and delivers Warning events for terminal failures.
pub struct EventReporter {
    sink: Arc<dyn EventSink>,
    workloads: Arc<dyn WorkloadRepository>,
    correlator: EventCorrelator,
    receiver: Receiver,
    labels: BTreeMap<String, String>,
    namespace: String,
    pod_name: String,
    clock: Arc<dyn Clock>,
    max_tries: u32,
    retry_sleep: Duration,
}

impl EventReporter {
    pub fn new(
        sink: Arc<dyn EventSink>,
        workloads: Arc<dyn WorkloadRepository>,
        correlator: EventCorrelator,
        receiver: Receiver,
        cfg: &SyncConfig,
        pod_name: String,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            sink,
            workloads,
            correlator,
            receiver,
            labels: cfg.session_labels(),
            namespace: cfg.namespace.clone(),
            pod_name,
            clock,
            max_tries: DEFAULT_MAX_TRIES,
            retry_sleep: DEFAULT_RETRY_SLEEP,
        }
    }

    /// Override the delivery retry policy.
    pub fn with_retry_policy(mut self, max_tries: u32, retry_sleep: Duration) -> Self {
        self.max_tries = max_tries;
        self.retry_sleep = retry_sleep;
        self
    }

    pub fn receiver(&self) -> &Receiver {
        &self.receiver
    }

    /// Emit one Warning event about a declaration, attached to the receiver.
    pub async fn warning(
        &self,
        reason: &str,
        message: &str,
        declaration_kind: &str,
        declaration_name: &str,
    ) {
        let producer = resolve_producer(self.workloads.as_ref(), &self.pod_name).await;
        let event = self.make_event(reason, message, declaration_kind, declaration_name, &producer);

        match self.correlator.correlate(&event) {
            CorrelateResult::Skip => {
                debug!(reason = %reason, "event suppressed by spam filter");
            }
            CorrelateResult::Deliver { event, patch } => {
                self.record_to_sink(event, patch).await;
            }
        }
    }

    fn make_event(
        &self,
        reason: &str,
        message: &str,
        declaration_kind: &str,
        declaration_name: &str,
        producer: &Producer,
    ) -> Event {
        let now = self.clock.now();
        let annotations = BTreeMap::from([
            (
                "relatedCR".to_string(),
                format!("{declaration_kind}/{declaration_name}"),
            ),
            (
                "producedByEntity".to_string(),
                format!("{}/{}", producer.kind, producer.name),
            ),
            ("producerUID".to_string(), producer.uid.clone()),
            ("producedByPod".to_string(), self.pod_name.clone()),
            (
                "relatedToRuntimeObject".to_string(),
                format!("{}/{}", self.receiver.kind.as_str(), self.receiver.name),
            ),
            (
                "runtimeObjectResourceVersion".to_string(),
                self.receiver.resource_version.clone().unwrap_or_default(),
            ),
        ]);

        let mut event = Event {
            involved_object: ObjectReference {
                kind: Some(self.receiver.kind.as_str().to_string()),
                api_version: Some(match self.receiver.kind {
                    ReceiverKind::Deployment => "apps/v1".to_string(),
                    ReceiverKind::Job => "batch/v1".to_string(),
                }),
                namespace: Some(self.namespace.clone()),
                name: Some(self.receiver.name.clone()),
                uid: self.receiver.uid.clone(),
                ..Default::default()
            },
            source: Some(EventSource {
                component: Some(EVENT_SOURCE_COMPONENT.to_string()),
                host: Some(EVENT_SOURCE_INSTANCE.to_string()),
            }),
            reporting_component: Some(EVENT_SOURCE_COMPONENT.to_string()),
            reporting_instance: Some(EVENT_SOURCE_INSTANCE.to_string()),
            type_: Some("Warning".to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            count: Some(1),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            ..Default::default()
        };
        event.metadata.name = Some(event_name(&self.receiver.name, now));
        event.metadata.namespace = Some(self.namespace.clone());
        event.metadata.labels = Some(self.labels.clone());
        event.metadata.annotations = Some(annotations);
        event
    }

    /// Deliver with bounded, jittered retries. Patch when the correlator
    /// observed a repeat; fall back to create when the patched object is gone.
    async fn record_to_sink(&self, event: Event, patch: Option<serde_json::Value>) {
        let mut tries = 0u32;
        loop {
            if self.try_record(&event, patch.as_ref()).await {
                return;
            }
            tries += 1;
            if tries >= self.max_tries {
                warn!(
                    reason = event.reason.as_deref().unwrap_or_default(),
                    "unable to write event, retry limit exceeded"
                );
                return;
            }
            let mut delay = self.retry_sleep;
            if tries == 1 {
                delay = delay.mul_f64(rand::random::<f64>());
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// One delivery attempt. True means "done" (delivered or not worth
    /// retrying), false means retry.
    async fn try_record(&self, event: &Event, patch: Option<&serde_json::Value>) -> bool {
        if event.count.unwrap_or(0) > 1 {
            if let Some(body) = patch {
                let name = event.metadata.name.clone().unwrap_or_default();
                match self.sink.patch(&name, body).await {
                    Ok(delivered) => {
                        self.correlator.update_state(&delivered);
                        return true;
                    }
                    Err(e) if crate::error::is_kube_not_found(&e) => {
                        // Cached event object is gone; fall through to create.
                    }
                    Err(e) => return classify_delivery_error(&e),
                }
            }
        }

        let mut fresh = event.clone();
        fresh.metadata.resource_version = None;
        match self.sink.create(&fresh).await {
            Ok(delivered) => {
                self.correlator.update_state(&delivered);
                true
            }
            Err(e) => classify_delivery_error(&e),
        }
    }
}

/// True when the error is not worth retrying (treated as delivered).
fn classify_delivery_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => {
            if resp.reason == "AlreadyExists" || resp.message.contains("is being terminated") {
                debug!(error = %err, "server rejected event, will not retry");
                true
            } else {
                warn!(error = %err, "server rejected event, may retry after sleeping");
                false
            }
        }
        kube::Error::SerdeError(_) | kube::Error::BuildRequest(_) => {
            warn!(error = %err, "unable to construct event, will not retry");
            true
        }
        _ => {
            warn!(error = %err, "unable to write event, may retry after sleeping");
            false
        }
    }
}

fn event_name(receiver_name: &str, now: DateTime<Utc>) -> String {
    format!(
        "{receiver_name}.{:x}",
        now.timestamp_nanos_opt().unwrap_or_default()
    )
}
