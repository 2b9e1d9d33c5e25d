//! Verification outcomes and the closed failure taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a candidate item was rejected.
///
/// Every kind except `Unknown` is recoverable by discarding the item and
/// trying the next candidate. `Unknown` covers generation-service transport
/// and decode failures, which are recovered by re-requesting the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    SanitizeFailed,
    CompileFailed,
    ContentInvalid,
    SchemaFailed,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::SanitizeFailed => "SANITIZE_FAILED",
            FailureKind::CompileFailed => "COMPILE_FAILED",
            FailureKind::ContentInvalid => "CONTENT_INVALID",
            FailureKind::SchemaFailed => "SCHEMA_FAILED",
            FailureKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a verification stage.
///
/// A reason exists exactly when the stage failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerificationResult {
    Passed,
    Failed { code: FailureKind, reason: String },
}

impl VerificationResult {
    pub fn failed(code: FailureKind, reason: impl Into<String>) -> Self {
        VerificationResult::Failed {
            code,
            reason: reason.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        matches!(self, VerificationResult::Passed)
    }

    pub fn code(&self) -> Option<FailureKind> {
        match self {
            VerificationResult::Passed => None,
            VerificationResult::Failed { code, .. } => Some(*code),
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            VerificationResult::Passed => None,
            VerificationResult::Failed { reason, .. } => Some(reason),
        }
    }
}

impl fmt::Display for VerificationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationResult::Passed => f.write_str("passed"),
            VerificationResult::Failed { code, reason } => write!(f, "{}: {}", code, reason),
        }
    }
}
