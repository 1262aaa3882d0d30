//! Error types for the synchronizer.
//!
//! Every reconciliation and waiting error bubbles up synchronously as a
//! value; only the top of `main` maps fatal results to process exit, so the
//! fatal paths stay unit-testable.

use thiserror::Error;

/// Error type for synchronizer operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Declaration manifest could not be decoded
    #[error("Manifest error: {0}")]
    Manifest(String),

    /// Missing required field in a resource or in the environment
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// The owning controller reported a terminal failure phase
    #[error("Declaration {name} failed: {reason}: {message}")]
    DeclarationFailed {
        name: String,
        reason: String,
        message: String,
    },

    /// The waiter's wall-clock timeout fired before a terminal phase
    #[error("Timed out waiting for declaration {name}")]
    WaitTimeout { name: String },

    /// Optimistic-concurrency retries exhausted
    #[error("Conflict retries exhausted updating {name} after {attempts} attempts")]
    ConflictRetriesExhausted { name: String, attempts: u32 },

    /// A generator task panicked or was aborted
    #[error("Generator task failed: {0}")]
    TaskJoin(String),

    /// The server-side watch on a declaration failed
    #[error("Watch error: {0}")]
    Watch(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error indicates an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 409)
    }

    /// Whether this error must abort the whole synchronization run.
    ///
    /// Everything except a not-found lookup is fatal here: a create/update
    /// failure means the target CRD is missing or malformed, and a terminal
    /// declaration failure means the deployment itself is unsafe to continue.
    pub fn is_fatal(&self) -> bool {
        !self.is_not_found()
    }
}

/// Result type alias for synchronizer operations
pub type Result<T> = std::result::Result<T, Error>;

/// Check whether a raw kube error is a 409 conflict.
pub fn is_kube_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

/// Check whether a raw kube error is a 404.
pub fn is_kube_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 404)
}
