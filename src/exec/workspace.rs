/// Run-scoped staging roots
///
/// Each run gets `<workspace_root>/<run_id>`. Sources are written read-only;
/// `scratch/` is the only writable directory and doubles as HOME and TMPDIR.
/// The root is removed synchronously by `cleanup`, and by `Drop` as a fallback.
use crate::artifact::objects::{sha256_hex, ObjectStore};
use crate::artifact::{SubmissionArtifact, RESERVED_SCRATCH_DIR};
use crate::config::presets::RuntimeEnvelope;
use crate::config::types::{EvalError, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

const SOURCE_MODE: u32 = 0o444;
const DIR_MODE: u32 = 0o555;
const SCRATCH_MODE: u32 = 0o1777;

/// Staged per-run root
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    root: PathBuf,
    entry_fingerprint: String,
    cleaned: bool,
}

impl Workspace {
    /// Fetch, verify and write every file of the artifact
    pub fn stage(
        base_dir: &Path,
        run_id: &str,
        artifact: &SubmissionArtifact,
        objects: &dyn ObjectStore,
        runtime: &RuntimeEnvelope,
    ) -> Result<Self> {
        fs::create_dir_all(base_dir).map_err(|e| {
            EvalError::SandboxConstruction(format!(
                "Failed to create workspace base {}: {}",
                base_dir.display(),
                e
            ))
        })?;

        let root = base_dir.join(run_id);
        fs::create_dir(&root).map_err(|e| {
            EvalError::SandboxConstruction(format!(
                "Failed to create workspace directory {}: {}",
                root.display(),
                e
            ))
        })?;

        // From here on Drop removes the root if staging fails halfway
        let mut workspace = Self {
            run_id: run_id.to_string(),
            root,
            entry_fingerprint: String::new(),
            cleaned: false,
        };

        for file in artifact.files() {
            let bytes = objects.fetch(&file.content_hash)?;
            verify_integrity(&file.name, &file.content_hash, file.size, &bytes)?;
            workspace.write_source(&file.name, &bytes)?;

            if file.name == artifact.entry() {
                workspace.entry_fingerprint = sha256_hex(&bytes);
                if file.name != runtime.canonical_entry {
                    workspace.write_source(&runtime.canonical_entry, &bytes)?;
                }
            }
        }

        let scratch = workspace.scratch_dir();
        fs::create_dir(&scratch)?;
        fs::set_permissions(&scratch, fs::Permissions::from_mode(SCRATCH_MODE))?;

        seal_directories(&workspace.root, &scratch)?;

        log::debug!(
            "Staged {} file(s) for run {} at {}",
            artifact.files().len(),
            run_id,
            workspace.root.display()
        );
        Ok(workspace)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.root.join(RESERVED_SCRATCH_DIR)
    }

    /// SHA-256 of the staged entry bytes
    pub fn entry_fingerprint(&self) -> &str {
        &self.entry_fingerprint
    }

    fn write_source(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let path = self.root.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, bytes).map_err(|e| {
            EvalError::SandboxConstruction(format!("Failed to stage {}: {}", path.display(), e))
        })?;
        fs::set_permissions(&path, fs::Permissions::from_mode(SOURCE_MODE))?;
        Ok(())
    }

    /// Remove the root (idempotent)
    pub fn cleanup(&mut self) -> Result<()> {
        if self.cleaned {
            return Ok(());
        }
        if self.root.exists() {
            make_removable(&self.root);
            fs::remove_dir_all(&self.root).map_err(|e| {
                EvalError::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to remove workspace {}: {}", self.root.display(), e),
                ))
            })?;
        }
        self.cleaned = true;
        Ok(())
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            log::warn!("Workspace cleanup for run {} failed: {}", self.run_id, e);
        }
    }
}

fn verify_integrity(name: &str, expected_hash: &str, expected_size: u64, bytes: &[u8]) -> Result<()> {
    if bytes.len() as u64 != expected_size {
        return Err(EvalError::Retrieval(format!(
            "{}: expected {} bytes, object has {}",
            name,
            expected_size,
            bytes.len()
        )));
    }
    let actual = sha256_hex(bytes);
    if actual != expected_hash {
        return Err(EvalError::Retrieval(format!(
            "{}: content hash mismatch (expected {}, got {})",
            name, expected_hash, actual
        )));
    }
    Ok(())
}

/// Make every staged directory read-only except scratch, deepest first
fn seal_directories(dir: &Path, scratch: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path == scratch {
            continue;
        }
        if fs::symlink_metadata(&path)?.is_dir() {
            seal_directories(&path, scratch)?;
        }
    }
    fs::set_permissions(dir, fs::Permissions::from_mode(DIR_MODE))?;
    Ok(())
}

/// Restore owner access everywhere so removal cannot be blocked by modes
/// the submission set inside scratch. Errors are left to `remove_dir_all`.
fn make_removable(dir: &Path) {
    let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if let Ok(meta) = fs::symlink_metadata(&path) {
            if meta.is_dir() {
                make_removable(&path);
            }
        }
    }
}
