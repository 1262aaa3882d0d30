//! Loosely-typed declaration model.
//!
//! Declarations flow through one pipeline regardless of their CRD schema, so
//! they are kept as `DynamicObject`s with typed accessors only for the few
//! fields the engine actually inspects: `status.phase`, the failure
//! reason/message, labels, and owner references.

use kube::api::DynamicObject;
use kube::core::ApiResource;
use kube::ResourceExt;

use crate::config::MANAGED_BY;

/// Coarse-grained status phase driving the wait state machine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Blocked on another resource
    WaitingForDependency,
    /// Owning controller is retrying
    BackingOff,
    /// Controller applying change
    Updating,
    /// Terminal failure
    InvalidConfiguration,
    /// Terminal success
    Updated,
    /// Any phase value this engine does not recognize
    Unknown(String),
}

impl Phase {
    pub fn parse(value: &str) -> Self {
        match value {
            "WaitingForDependency" => Phase::WaitingForDependency,
            "BackingOff" => Phase::BackingOff,
            "Updating" => Phase::Updating,
            "InvalidConfiguration" => Phase::InvalidConfiguration,
            "Updated" => Phase::Updated,
            other => Phase::Unknown(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Phase::WaitingForDependency => "WaitingForDependency",
            Phase::BackingOff => "BackingOff",
            Phase::Updating => "Updating",
            Phase::InvalidConfiguration => "InvalidConfiguration",
            Phase::Updated => "Updated",
            Phase::Unknown(other) => other,
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully-qualified dynamic resource target: GVR plus kind.
///
/// The same CRD kind may be registered under more than one API group for
/// backward compatibility, so one logical kind expands into several targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetResource {
    pub group: String,
    pub version: String,
    pub plural: String,
    pub kind: String,
}

impl TargetResource {
    pub fn new(group: &str, version: &str, plural: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            plural: plural.to_string(),
            kind: kind.to_string(),
        }
    }

    /// The `ApiResource` used to address this target through the dynamic API.
    pub fn api_resource(&self) -> ApiResource {
        let api_version = if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        };
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version,
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

impl std::fmt::Display for TargetResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.plural)
    }
}

/// Read `status.phase` from a dynamic declaration, if populated.
pub fn phase_of(obj: &DynamicObject) -> Option<Phase> {
    obj.data
        .get("status")
        .and_then(|s| s.get("phase"))
        .and_then(|p| p.as_str())
        .map(Phase::parse)
}

/// Extract the reason and message a terminal failure should be reported with.
///
/// Preference order: explicit `status.reason`/`status.message`, then the last
/// status condition, then the phase string itself.
pub fn failure_reason_message(obj: &DynamicObject) -> (String, String) {
    let status = obj.data.get("status");

    let field = |name: &str| {
        status
            .and_then(|s| s.get(name))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    let last_condition = status
        .and_then(|s| s.get("conditions"))
        .and_then(|c| c.as_array())
        .and_then(|arr| arr.last());
    let condition_field = |name: &str| {
        last_condition
            .and_then(|c| c.get(name))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    };

    let phase = phase_of(obj)
        .map(|p| p.to_string())
        .unwrap_or_else(|| "InvalidConfiguration".to_string());

    let reason = field("reason")
        .or_else(|| condition_field("reason"))
        .unwrap_or_else(|| phase.clone());
    let message = field("message")
        .or_else(|| condition_field("message"))
        .unwrap_or(phase);
    (reason, message)
}

/// Stamp the managed-by label onto a declaration, preserving existing labels.
pub fn inject_managed_by_label(obj: &mut DynamicObject) {
    obj.labels_mut()
        .insert("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string());
}

/// Whether the declaration already carries any owner reference.
pub fn has_owner_reference(obj: &DynamicObject) -> bool {
    !obj.owner_references().is_empty()
}
