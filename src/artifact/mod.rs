//! Submission artifacts
//!
//! An artifact is the immutable description of what a submitter uploaded:
//! files by content hash plus the entry to run. Both upload shapes resolve
//! into the same representation at construction, so nothing downstream
//! branches on shape.

pub mod objects;

use crate::config::presets::RuntimeEnvelope;
use crate::config::types::{SubmissionId, ValidationFailure};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Staging directory name reserved for the run's writable scratch space
pub const RESERVED_SCRATCH_DIR: &str = "scratch";

/// One file of a submission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Relative path inside the staged root
    pub name: String,
    /// Lowercase hex SHA-256 of the content
    pub content_hash: String,
    pub size: u64,
}

/// Upload shape as it arrives from intake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum SubmissionShape {
    /// A lone script; it is its own entry
    SingleScript { file: ArtifactFile },
    /// Several files with a designated entry
    Bundle { files: Vec<ArtifactFile>, entry: String },
}

/// Immutable submission descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionArtifact {
    id: SubmissionId,
    files: Vec<ArtifactFile>,
    entry: String,
    environment_id: String,
    algorithm: String,
    submitter_id: String,
}

impl SubmissionArtifact {
    pub fn from_shape(
        id: SubmissionId,
        shape: SubmissionShape,
        environment_id: impl Into<String>,
        algorithm: impl Into<String>,
        submitter_id: impl Into<String>,
    ) -> Self {
        let (files, entry) = match shape {
            SubmissionShape::SingleScript { file } => {
                let entry = file.name.clone();
                (vec![file], entry)
            }
            SubmissionShape::Bundle { files, entry } => (files, entry),
        };

        Self {
            id,
            files,
            entry,
            environment_id: environment_id.into(),
            algorithm: algorithm.into(),
            submitter_id: submitter_id.into(),
        }
    }

    pub fn single(
        id: SubmissionId,
        file: ArtifactFile,
        environment_id: impl Into<String>,
        algorithm: impl Into<String>,
        submitter_id: impl Into<String>,
    ) -> Self {
        Self::from_shape(
            id,
            SubmissionShape::SingleScript { file },
            environment_id,
            algorithm,
            submitter_id,
        )
    }

    pub fn bundle(
        id: SubmissionId,
        files: Vec<ArtifactFile>,
        entry: impl Into<String>,
        environment_id: impl Into<String>,
        algorithm: impl Into<String>,
        submitter_id: impl Into<String>,
    ) -> Self {
        Self::from_shape(
            id,
            SubmissionShape::Bundle {
                files,
                entry: entry.into(),
            },
            environment_id,
            algorithm,
            submitter_id,
        )
    }

    pub fn id(&self) -> &SubmissionId {
        &self.id
    }

    pub fn files(&self) -> &[ArtifactFile] {
        &self.files
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }

    pub fn submitter_id(&self) -> &str {
        &self.submitter_id
    }

    pub fn entry_file(&self) -> Option<&ArtifactFile> {
        self.files.iter().find(|f| f.name == self.entry)
    }

    /// Structural checks that need no I/O. Runs before any process starts.
    pub fn validate(&self, runtime: &RuntimeEnvelope) -> Result<(), ValidationFailure> {
        if self.files.is_empty() {
            return Err(ValidationFailure::EmptyBundle);
        }

        if self.environment_id.trim().is_empty() {
            return Err(ValidationFailure::MissingEnvironment);
        }

        let mut seen = HashSet::new();
        for file in &self.files {
            if !is_safe_relative_name(&file.name) {
                return Err(ValidationFailure::UnsafeFileName(file.name.clone()));
            }
            if !seen.insert(file.name.as_str()) {
                return Err(ValidationFailure::DuplicateFile(file.name.clone()));
            }
            if file.name != self.entry && file.name == runtime.canonical_entry {
                return Err(ValidationFailure::CanonicalNameClash(file.name.clone()));
            }
        }

        // A file cannot also be a parent directory, and the canonical entry
        // is staged as a file at the top level.
        for file in &self.files {
            let mut path = file.name.as_str();
            while let Some((parent, _)) = path.rsplit_once('/') {
                if seen.contains(parent) || parent == runtime.canonical_entry {
                    return Err(ValidationFailure::PathConflict(file.name.clone()));
                }
                path = parent;
            }
        }

        if !seen.contains(self.entry.as_str()) {
            return Err(ValidationFailure::EntryMissing(self.entry.clone()));
        }

        let entry_name = Path::new(&self.entry)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !runtime.accepts_entry(&entry_name) {
            return Err(ValidationFailure::EntryExtension {
                entry: self.entry.clone(),
                expected: runtime.script_extension.clone(),
            });
        }

        Ok(())
    }
}

/// Relative, no `..`/`.`/empty segments, no NUL, not inside the scratch dir
fn is_safe_relative_name(name: &str) -> bool {
    if name.is_empty() || name.starts_with('/') || name.contains('\0') || name.contains('\\') {
        return false;
    }

    if name.split('/').next() == Some(RESERVED_SCRATCH_DIR) {
        return false;
    }

    name.split('/')
        .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}
