//! What a run did, and why a run failed.

use serde::Serialize;
use std::fmt;

use crate::artifact::ArtifactState;
use crate::error::{ArtifactError, ErrorKind};
use crate::rules::RuleMatch;

/// One rewritten or failed class artifact.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub artifact: String,
    pub state: ArtifactState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Whether the original bytes were forwarded despite the failure.
    pub passthrough: bool,
    pub elapsed_ms: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub incremental: bool,
    pub units: usize,
    /// Units whose previous output was reused without re-reading.
    pub reused_units: usize,
    /// Outputs of vanished inputs that were deleted.
    pub removed_outputs: usize,
    pub classes_rewritten: usize,
    pub classes_skipped: usize,
    pub classes_failed: usize,
    /// Non-class files forwarded as-is.
    pub resources_copied: usize,
    pub matches: Vec<RuleMatch>,
    pub artifacts: Vec<ArtifactRecord>,
    pub elapsed_ms: f64,
}

/// A failing artifact, as reported to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub artifact: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn new(artifact: impl Into<String>, error: &ArtifactError) -> Self {
        Self {
            artifact: artifact.into(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.artifact, self.kind, self.message)
    }
}

struct FailureList<'a>(&'a [Failure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for failure in self.0 {
            write!(f, "\n  {failure}")?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    /// The ruleset is inconsistent; nothing was written.
    #[error("conflicting rules in {} artifact(s):{}", .0.len(), FailureList(.0))]
    Conflict(Vec<Failure>),

    #[error("{} artifact(s) failed:{}", .0.len(), FailureList(.0))]
    Failed(Vec<Failure>),

    #[error("transform cancelled")]
    Cancelled,

    #[error(transparent)]
    Setup(#[from] anyhow::Error),
}
