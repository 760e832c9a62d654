//! Typed errors for each module boundary, each mapping onto one of the six
//! error kinds a caller ultimately needs: Transient, Validation, Stale,
//! Timeout, Safety, Fatal.

use thiserror::Error;

/// The six-way error taxonomy every module-boundary error collapses into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum ErrorKind {
    Transient,
    Validation,
    Stale,
    Timeout,
    Safety,
    Fatal,
}

use serde::{Deserialize, Serialize};

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "Transient",
            Self::Validation => "Validation",
            Self::Stale => "Stale",
            Self::Timeout => "Timeout",
            Self::Safety => "Safety",
            Self::Fatal => "Fatal",
        }
    }
}

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("time-series backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("no data for query {0}")]
    NoData(String),
    #[error("malformed trigger payload: {0}")]
    MalformedPayload(String),
    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),
}

impl TriggerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BackendUnavailable(_) => ErrorKind::Transient,
            Self::NoData(_) => ErrorKind::Transient,
            Self::MalformedPayload(_) => ErrorKind::Validation,
            Self::Kube(_) => ErrorKind::Transient,
        }
    }
}

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("dry-run mode mismatch")]
    DryRunMismatch,
    #[error("resource is protected: {0}")]
    Protected(String),
    #[error("circuit breaker open for policy {0}")]
    CircuitOpen(String),
    #[error("rate limit exceeded for policy {0}")]
    RateLimited(String),
    #[error("unresolvable target: {0}")]
    UnresolvableTarget(String),
    #[error("forbidden delete on kind {0}")]
    ForbiddenDelete(String),
    #[error("missing payload for action type {0}")]
    MissingPayload(String),
    #[error("inverted range: {0}")]
    InvertedRange(String),
}

impl ValidationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DryRunMismatch | Self::CircuitOpen(_) | Self::RateLimited(_) => {
                ErrorKind::Safety
            }
            Self::Protected(_)
            | Self::ForbiddenDelete(_)
            | Self::MissingPayload(_)
            | Self::InvertedRange(_) => ErrorKind::Validation,
            Self::UnresolvableTarget(_) => ErrorKind::Stale,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("unsupported kind {0} for this executor")]
    UnsupportedKind(String),
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("path did not resolve: {0}")]
    UnresolvedPath(String),
    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnsupportedKind(_) | Self::Validation(_) | Self::UnresolvedPath(_) => {
                ErrorKind::Validation
            }
            Self::Kube(_) => ErrorKind::Transient,
        }
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("action {0} already in flight")]
    Conflict(String),
    #[error("unknown action type {0}")]
    UnknownActionType(String),
    #[error("target stale: expected uid {expected}, found {found}")]
    StaleTarget { expected: String, found: String },
    #[error("no rollback history for {0}")]
    NoHistory(String),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error("kube API error: {0}")]
    Kube(#[from] kube::Error),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Conflict(_) => ErrorKind::Transient,
            Self::UnknownActionType(_) => ErrorKind::Fatal,
            Self::StaleTarget { .. } => ErrorKind::Stale,
            Self::NoHistory(_) => ErrorKind::Stale,
            Self::Executor(e) => e.kind(),
            Self::Kube(_) => ErrorKind::Transient,
        }
    }
}

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("history for {0} has aged out of the retention horizon")]
    Stale(String),
}

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("finalizer error: {0}")]
    Finalizer(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_error_kinds() {
        assert_eq!(
            TriggerError::NoData("x".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            TriggerError::MalformedPayload("x".into()).kind(),
            ErrorKind::Validation
        );
    }

    #[test]
    fn validation_error_kinds() {
        assert_eq!(ValidationError::DryRunMismatch.kind(), ErrorKind::Safety);
        assert_eq!(
            ValidationError::Protected("ns".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            ValidationError::UnresolvableTarget("x".into()).kind(),
            ErrorKind::Stale
        );
    }

    #[test]
    fn engine_error_kinds() {
        assert_eq!(
            EngineError::UnknownActionType("foo".into()).kind(),
            ErrorKind::Fatal
        );
        assert_eq!(
            EngineError::StaleTarget {
                expected: "a".into(),
                found: "b".into()
            }
            .kind(),
            ErrorKind::Stale
        );
    }

    #[test]
    fn error_kind_as_str_matches_condition_reason_convention() {
        assert_eq!(ErrorKind::Safety.as_str(), "Safety");
        assert_eq!(ErrorKind::Fatal.as_str(), "Fatal");
    }
}
