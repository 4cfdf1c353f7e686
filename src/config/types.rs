/// Shared type definitions for evalbox
///
/// Error taxonomy, identifiers and the closed enums every layer agrees on.
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Result type used across the crate
pub type Result<T> = std::result::Result<T, EvalError>;

/// Evaluation engine errors
///
/// Submitter-caused outcomes (timeout, non-zero exit, missing score) are not
/// errors; they surface as a failed `EvaluationResult`. Everything here is
/// either a rejected artifact or trouble on our side of the boundary.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationFailure),

    #[error("Sandbox construction error: {0}")]
    SandboxConstruction(String),

    #[error("Object retrieval error: {0}")]
    Retrieval(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid leaderboard score: {0}")]
    InvalidScore(f64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EvalError {
    /// Host or storage trouble, never the submitter's fault
    pub fn is_infrastructure(&self) -> bool {
        match self {
            EvalError::Validation(failure) => failure.is_infrastructure(),
            EvalError::SandboxConstruction(_)
            | EvalError::Retrieval(_)
            | EvalError::Persistence(_)
            | EvalError::Io(_) => true,
            EvalError::Config(_) | EvalError::InvalidScore(_) | EvalError::Json(_) => false,
        }
    }

    /// Whether redelivering the same job can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            EvalError::Validation(failure) => failure.is_infrastructure(),
            EvalError::SandboxConstruction(_)
            | EvalError::Retrieval(_)
            | EvalError::Persistence(_) => true,
            _ => false,
        }
    }

    /// Short stable label for logs and reports
    pub fn class(&self) -> &'static str {
        match self {
            EvalError::Validation(_) => "validation",
            EvalError::SandboxConstruction(_) => "sandbox_construction",
            EvalError::Retrieval(_) => "retrieval",
            EvalError::Persistence(_) => "persistence",
            EvalError::Config(_) => "config",
            EvalError::InvalidScore(_) => "invalid_score",
            EvalError::Io(_) => "io",
            EvalError::Json(_) => "json",
        }
    }
}

impl From<rusqlite::Error> for EvalError {
    fn from(err: rusqlite::Error) -> Self {
        EvalError::Persistence(err.to_string())
    }
}

/// Reasons an artifact is rejected before any process starts
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    #[error("submission contains no files")]
    EmptyBundle,

    #[error("entry file '{0}' is not part of the submission")]
    EntryMissing(String),

    #[error("entry file '{entry}' must have the '.{expected}' extension")]
    EntryExtension { entry: String, expected: String },

    #[error("file name '{0}' is not a safe relative path")]
    UnsafeFileName(String),

    #[error("file '{0}' appears more than once in the submission")]
    DuplicateFile(String),

    #[error("file '{0}' clashes with the canonical entry name")]
    CanonicalNameClash(String),

    #[error("file '{0}' needs a directory where another file is staged")]
    PathConflict(String),

    #[error("environment identifier is empty")]
    MissingEnvironment,

    #[error("sandbox backend '{backend}' unavailable: {detail}")]
    SandboxUnavailable { backend: String, detail: String },
}

impl ValidationFailure {
    /// Missing host tooling is rejected up front but is not a submitter error
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, ValidationFailure::SandboxUnavailable { .. })
    }
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Identity of one evaluation job attempt
    JobId
);
string_id!(
    /// Identity assigned to a submission at intake
    SubmissionId
);

/// Lifecycle of one evaluation job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(JobState::Queued),
            "running" => Some(JobState::Running),
            "succeeded" => Some(JobState::Succeeded),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    /// Allowed edges of the job state machine.
    /// `Running -> Queued` only happens when infrastructure hands a job back.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Queued, JobState::Running)
                | (JobState::Queued, JobState::Failed)
                | (JobState::Running, JobState::Succeeded)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Queued)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
