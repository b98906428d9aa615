//! Korral core types: resource identity, point-in-time snapshots,
//! the uniform result envelope and per-pod log bundles.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

mod envelope;
mod selector;

pub use envelope::{ErrorKind, ResultEnvelope};
pub use selector::{LabelSelector, SelectorOp, SelectorRequirement};

pub const DEFAULT_NAMESPACE: &str = "default";

const DNS_LABEL_MAX: usize = 63;
const DNS_SUBDOMAIN_MAX: usize = 253;

static DNS_LABEL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static dns label regex")
});

static DNS_SUBDOMAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("static dns subdomain regex")
});

/// Argument or identity rejected before any cluster call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { field: field.into(), reason: reason.into() }
    }
}

/// Namespaces are RFC 1123 labels.
pub fn validate_namespace(ns: &str) -> Result<(), ValidationError> {
    if ns.is_empty() {
        return Err(ValidationError::new("namespace", "must not be empty"));
    }
    if ns.len() > DNS_LABEL_MAX {
        return Err(ValidationError::new("namespace", format!("longer than {} characters", DNS_LABEL_MAX)));
    }
    if !DNS_LABEL.is_match(ns) {
        return Err(ValidationError::new("namespace", format!("'{}' is not a lowercase DNS label", ns)));
    }
    Ok(())
}

/// Object names (pods, deployments) are RFC 1123 subdomains.
pub fn validate_object_name(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    if name.len() > DNS_SUBDOMAIN_MAX {
        return Err(ValidationError::new(field, format!("longer than {} characters", DNS_SUBDOMAIN_MAX)));
    }
    if !DNS_SUBDOMAIN.is_match(name) {
        return Err(ValidationError::new(field, format!("'{}' is not a lowercase DNS subdomain", name)));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Pod,
    Deployment,
    /// Target of namespace-wide list actions; `name` equals the namespace.
    Namespace,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Deployment => "deployment",
            ResourceKind::Namespace => "namespace",
        }
    }
}

/// Identity key for a namespaced object. Only constructible through the
/// validating constructors, so every live value is well-formed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawResourceRef")]
pub struct ResourceRef {
    kind: ResourceKind,
    namespace: String,
    name: String,
}

#[derive(Deserialize)]
struct RawResourceRef {
    kind: ResourceKind,
    namespace: String,
    name: String,
}

impl TryFrom<RawResourceRef> for ResourceRef {
    type Error = ValidationError;

    fn try_from(raw: RawResourceRef) -> Result<Self, Self::Error> {
        ResourceRef::new(raw.kind, raw.namespace, raw.name)
    }
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, ValidationError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_namespace(&namespace)?;
        match kind {
            ResourceKind::Namespace => {
                if name != namespace {
                    return Err(ValidationError::new("name", "namespace refs must be named after the namespace"));
                }
            }
            ResourceKind::Pod => validate_object_name("pod_name", &name)?,
            ResourceKind::Deployment => validate_object_name("deployment_name", &name)?,
        }
        Ok(Self { kind, namespace, name })
    }

    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(ResourceKind::Deployment, namespace, name)
    }

    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Result<Self, ValidationError> {
        Self::new(ResourceKind::Pod, namespace, name)
    }

    pub fn namespace(namespace: impl Into<String>) -> Result<Self, ValidationError> {
        let ns = namespace.into();
        Self::new(ResourceKind::Namespace, ns.clone(), ns)
    }

    /// `namespace/default`; the target of last resort when arguments are too
    /// broken to name anything better.
    pub fn default_namespace() -> Self {
        Self { kind: ResourceKind::Namespace, namespace: DEFAULT_NAMESPACE.to_string(), name: DEFAULT_NAMESPACE.to_string() }
    }

    pub fn kind(&self) -> ResourceKind { self.kind }
    pub fn namespace_str(&self) -> &str { &self.namespace }
    pub fn name(&self) -> &str { &self.name }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ResourceKind::Namespace => write!(f, "namespace/{}", self.namespace),
            kind => write!(f, "{}/{}/{}", kind.as_str(), self.namespace, self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    /// Map the API's `status.phase` string; anything unrecognised is `Unknown`.
    pub fn from_api(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSnapshot {
    pub name: String,
    pub phase: PodPhase,
    pub ip: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSnapshot {
    pub name: String,
    pub ready_replicas: i32,
    pub desired_replicas: i32,
    pub available_replicas: i32,
    pub updated_replicas: i32,
    pub images: Vec<String>,
    pub age_seconds: f64,
    pub healthy: bool,
    #[serde(default)]
    pub selector: LabelSelector,
}

impl DeploymentSnapshot {
    /// A deployment is healthy when every desired replica is both ready and available.
    pub fn is_healthy(ready: i32, desired: i32, available: i32) -> bool {
        ready == desired && available == desired
    }
}

/// Logs of a single pod inside a [`LogBundle`]. Either `text` is non-empty or
/// `error` is set; constructors keep it that way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodLog {
    pub text: String,
    pub error: Option<String>,
    #[serde(default)]
    pub truncated: bool,
}

pub const EMPTY_LOG_WINDOW: &str = "no log output in the requested window";

impl PodLog {
    pub fn from_output(text: String, truncated: bool) -> Self {
        if text.is_empty() {
            return Self::failed(EMPTY_LOG_WINDOW);
        }
        Self { text, error: None, truncated }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        let mut error = error.into();
        if error.is_empty() {
            error = "unknown error".to_string();
        }
        Self { text: String::new(), error: Some(error), truncated: false }
    }

    pub fn is_ok(&self) -> bool { self.error.is_none() }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogBundle {
    pub target: ResourceRef,
    pub per_pod: BTreeMap<String, PodLog>,
}

impl LogBundle {
    pub fn new(target: ResourceRef) -> Self {
        Self { target, per_pod: BTreeMap::new() }
    }

    pub fn ok_count(&self) -> usize {
        self.per_pod.values().filter(|p| p.is_ok()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.per_pod.len() - self.ok_count()
    }
}

pub mod prelude {
    pub use super::{
        DeploymentSnapshot, ErrorKind, LabelSelector, LogBundle, PodLog, PodPhase, PodSnapshot, ResourceKind, ResourceRef,
        ResultEnvelope, ValidationError, DEFAULT_NAMESPACE,
    };
}
