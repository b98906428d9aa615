//! Uniform success/failure wrapper returned by every action.

use serde::{Deserialize, Serialize};

use crate::ResourceRef;

/// Failure taxonomy carried by a failed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad arguments; no cluster call was made.
    Validation,
    NotFound,
    /// Network, rate-limit or server fault. Retryable.
    Transient,
    /// The API refused the request (forbidden, invalid). Not retryable.
    Rejected,
    /// A mutation for the same target is already in flight.
    Conflict,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::Rejected => "rejected",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

/// A failed envelope never carries data and always names its [`ErrorKind`];
/// a successful one never carries an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope<T> {
    success: bool,
    message: String,
    data: Option<T>,
    target: ResourceRef,
    error: Option<ErrorKind>,
}

impl<T> ResultEnvelope<T> {
    pub fn ok(target: ResourceRef, message: impl Into<String>, data: T) -> Self {
        Self { success: true, message: message.into(), data: Some(data), target, error: None }
    }

    pub fn fail(target: ResourceRef, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), data: None, target, error: Some(kind) }
    }

    pub fn success(&self) -> bool { self.success }
    pub fn message(&self) -> &str { &self.message }
    pub fn data(&self) -> Option<&T> { self.data.as_ref() }
    pub fn target(&self) -> &ResourceRef { &self.target }
    pub fn error(&self) -> Option<ErrorKind> { self.error }
}

impl<T: Serialize> ResultEnvelope<T> {
    /// Erase the payload type. A payload that fails to serialize turns the
    /// envelope into an `Internal` failure instead of escaping as an error.
    pub fn into_json(self) -> ResultEnvelope<serde_json::Value> {
        let data = match self.data.as_ref().map(serde_json::to_value).transpose() {
            Ok(v) => v,
            Err(e) => return ResultEnvelope::fail(self.target, ErrorKind::Internal, format!("failed to encode result: {}", e)),
        };
        ResultEnvelope { success: self.success, message: self.message, data, target: self.target, error: self.error }
    }
}
