//! Waiting for declarations to reach a terminal phase.
//!
//! A watch on the single declaration drives a small state machine: transient
//! phases keep waiting, `Updated` stamps the owner reference and completes,
//! `InvalidConfiguration` reports a Warning event and fails the deployment.
//! A wall-clock deadline races the watch; phases observed after it fires do
//! not count.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::DynamicObject;
use tracing::{debug, info, warn};

use crate::declaration::{failure_reason_message, phase_of, Phase, TargetResource};
use crate::error::{Error, Result};
use crate::events::EventReporter;
use crate::ownerref::OwnerRefReconciler;
use crate::repository::DeclarationRepository;

/// Reason attached to timeout Warning events.
pub const TIMEOUT_REASON: &str = "TimeOutReached";

/// What one observation of a declaration means for the wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepDecision {
    /// Transient or unpopulated phase, keep watching.
    Wait,
    /// Terminal success.
    Ready,
    /// Terminal failure, with the reason and message to report.
    Failed { reason: String, message: String },
}

/// Classify one observed state of a declaration.
///
/// A phase this engine does not recognize keeps the wait open rather than
/// failing it: new controller versions may introduce intermediate phases.
pub fn evaluate(obj: &DynamicObject) -> StepDecision {
    match phase_of(obj) {
        None => StepDecision::Wait,
        Some(Phase::Updated) => StepDecision::Ready,
        Some(Phase::InvalidConfiguration) => {
            let (reason, message) = failure_reason_message(obj);
            StepDecision::Failed { reason, message }
        }
        Some(Phase::WaitingForDependency) | Some(Phase::BackingOff) | Some(Phase::Updating) => {
            StepDecision::Wait
        }
        Some(Phase::Unknown(other)) => {
            debug!(phase = %other, "unrecognized phase, continuing to wait");
            StepDecision::Wait
        }
    }
}

/// Watches declarations until they succeed, fail, or time out.
pub struct DeclarationWaiter {
    repo: Arc<dyn DeclarationRepository>,
    reporter: Arc<EventReporter>,
    ownerref: Arc<OwnerRefReconciler>,
    timeout: Duration,
}

impl DeclarationWaiter {
    pub fn new(
        repo: Arc<dyn DeclarationRepository>,
        reporter: Arc<EventReporter>,
        ownerref: Arc<OwnerRefReconciler>,
        timeout: Duration,
    ) -> Self {
        Self {
            repo,
            reporter,
            ownerref,
            timeout,
        }
    }

    /// Wait until one declaration reaches its terminal success phase, then
    /// stamp its owner reference.
    pub async fn wait_ready(&self, target: &TargetResource, name: &str) -> Result<()> {
        info!(target = %target, name = %name, "waiting for declaration");
        let mut stream = self.repo.watch(target, name).fuse();
        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return self.timed_out(target, name).await,
                item = stream.next() => match item {
                    Some(Ok(obj)) => match evaluate(&obj) {
                        StepDecision::Wait => {
                            debug!(
                                target = %target,
                                name = %name,
                                phase = %phase_of(&obj).map(|p| p.to_string()).unwrap_or_default(),
                                "declaration not ready yet"
                            );
                        }
                        StepDecision::Ready => {
                            info!(target = %target, name = %name, "declaration ready");
                            return self.ownerref.ensure(target, name).await;
                        }
                        StepDecision::Failed { reason, message } => {
                            warn!(target = %target, name = %name, reason = %reason, "declaration failed");
                            self.reporter
                                .warning(&reason, &message, &target.kind, name)
                                .await;
                            return Err(Error::DeclarationFailed {
                                name: name.to_string(),
                                reason,
                                message,
                            });
                        }
                    },
                    Some(Err(e)) => {
                        // Watch errors are transient; the stream recovers on
                        // its own and the deadline bounds the wait.
                        warn!(target = %target, name = %name, error = %e, "watch error, continuing to wait");
                    }
                    None => {
                        // Watch ended without a terminal phase; only the
                        // deadline remains.
                        deadline.as_mut().await;
                        return self.timed_out(target, name).await;
                    }
                },
            }
        }
    }

    async fn timed_out(&self, target: &TargetResource, name: &str) -> Result<()> {
        let message = format!(
            "{} {} did not reach a terminal phase within {}s",
            target.kind,
            name,
            self.timeout.as_secs()
        );
        warn!(target = %target, name = %name, "{message}");
        self.reporter
            .warning(TIMEOUT_REASON, &message, &target.kind, name)
            .await;
        Err(Error::WaitTimeout {
            name: name.to_string(),
        })
    }
}
