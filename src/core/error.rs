//! Error types for ChangeOps operations.
//!
//! This module defines the canonical error type used throughout ChangeOps.
//! All subsystems return `Result<T, ChangeOpsError>`; the variants map
//! one-to-one onto the error taxonomy surfaced to callers and onto the CLI
//! exit codes (see `ChangeOpsError::exit_code`).

use rusqlite;
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Structured validation issue produced by package validation and patching.
///
/// Issues are returned in-band (inside `ChangeOpsError::Validation` or on a
/// draft's `last_preview_errors`) so the draft repair loop can feed them back
/// to the producer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Stable machine code, e.g. `DUPLICATE_RECORD_TYPE`, `REQUIRED_FIELD_REMOVED`.
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_type_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_type_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ValidationIssue {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            record_type_key: None,
            base_type_key: None,
            details: None,
        }
    }

    pub fn for_record_type(code: &str, message: impl Into<String>, record_type_key: &str) -> Self {
        let mut issue = Self::new(code, message);
        issue.record_type_key = Some(record_type_key.to_string());
        issue
    }
}

impl std::fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Canonical error type for all ChangeOps operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// The first group of variants is the caller-visible taxonomy; the trailing
/// variants auto-convert from library errors via `#[from]`.
#[derive(Error, Debug)]
pub enum ChangeOpsError {
    /// Data contract broken: tenant mismatch, unknown reference, dense
    /// ordering broken. Never retried.
    #[error("INVARIANT_VIOLATION: {0}")]
    InvariantViolation(String),

    /// Write on a governed entity without a change id.
    #[error("GOVERNANCE_REQUIRED: {0}")]
    GovernanceRequired(String),

    /// Capability profile lacks a required token.
    #[error("CAPABILITY_DENIED: {0}")]
    CapabilityDenied(String),

    /// Module boundary path validation failed.
    #[error("MODULE_BOUNDARY_ESCAPE: {0}")]
    ModuleBoundaryEscape(String),

    /// Optimistic version mismatch. Caller may retry after refresh.
    #[error("CONFLICT: {0}")]
    Conflict(String),

    /// Structured validation failure during package generation or patching.
    #[error("VALIDATION_ERROR: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    /// Upstream producer failure, surfaced after the retry budget.
    #[error("PRODUCER_ERROR: {0}")]
    Producer(String),

    #[error("NOT_FOUND: {0}")]
    NotFound(String),

    /// Operation requested on an entity whose status forbids it.
    #[error("STATE_INVALID: {0}")]
    StateInvalid(String),

    /// SQLite database error (auto-converts from `rusqlite::Error`)
    #[error("SQLite error: {0}")]
    RusqliteError(#[from] rusqlite::Error),

    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Store root or path resolution error
    #[error("Path error: {0}")]
    PathError(String),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    if issues.is_empty() {
        return "validation failed".to_string();
    }
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl ChangeOpsError {
    pub fn validation(code: &str, message: impl Into<String>) -> Self {
        Self::Validation(vec![ValidationIssue::new(code, message)])
    }

    /// CLI harness exit code: 0 success, 1 validation failure,
    /// 2 governance/capability denied, 3 conflict, 4 unexpected.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) | Self::InvariantViolation(_) | Self::StateInvalid(_) => 1,
            Self::GovernanceRequired(_)
            | Self::CapabilityDenied(_)
            | Self::ModuleBoundaryEscape(_) => 2,
            Self::Conflict(_) => 3,
            _ => 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_codes_appear_in_display() {
        let err = ChangeOpsError::InvariantViolation("tenant mismatch".to_string());
        assert_eq!(format!("{}", err), "INVARIANT_VIOLATION: tenant mismatch");

        let err = ChangeOpsError::GovernanceRequired("missing change id".to_string());
        assert!(format!("{}", err).starts_with("GOVERNANCE_REQUIRED"));

        let err = ChangeOpsError::Conflict("expected version 2, found 3".to_string());
        assert!(format!("{}", err).starts_with("CONFLICT"));
    }

    #[test]
    fn validation_display_joins_issues() {
        let err = ChangeOpsError::Validation(vec![
            ValidationIssue::new("DUPLICATE_RECORD_TYPE", "key 'ticket' repeated"),
            ValidationIssue::new("UNKNOWN_RECORD_TYPE", "sla references 'asset'"),
        ]);
        let rendered = format!("{}", err);
        assert!(rendered.contains("DUPLICATE_RECORD_TYPE"));
        assert!(rendered.contains("UNKNOWN_RECORD_TYPE"));
    }

    #[test]
    fn exit_codes_follow_harness_contract() {
        assert_eq!(ChangeOpsError::Validation(vec![]).exit_code(), 1);
        assert_eq!(
            ChangeOpsError::CapabilityDenied("FS_WRITE".to_string()).exit_code(),
            2
        );
        assert_eq!(
            ChangeOpsError::GovernanceRequired("x".to_string()).exit_code(),
            2
        );
        assert_eq!(ChangeOpsError::Conflict("x".to_string()).exit_code(), 3);
        assert_eq!(ChangeOpsError::NotFound("x".to_string()).exit_code(), 4);
    }
}
