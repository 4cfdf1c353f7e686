/// Content-addressed object retrieval
///
/// Submissions reference their files by lowercase hex SHA-256. The store behind
/// that hash is external in production; these are the local stand-ins.
use crate::config::types::{EvalError, Result};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Object retrieval by content hash
pub trait ObjectStore: Send + Sync {
    fn fetch(&self, content_hash: &str) -> Result<Vec<u8>>;

    /// Store bytes, returning their content hash
    fn put(&self, bytes: &[u8]) -> Result<String>;
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64 && hash.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Objects on disk as `<root>/<aa>/<full hash>`
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| {
            EvalError::Retrieval(format!("cannot create object root {}: {}", root.display(), e))
        })?;
        Ok(Self { root })
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.root.join(&hash[..2]).join(hash)
    }
}

impl ObjectStore for FsObjectStore {
    fn fetch(&self, content_hash: &str) -> Result<Vec<u8>> {
        if !is_valid_hash(content_hash) {
            return Err(EvalError::Retrieval(format!(
                "malformed content hash '{}'",
                content_hash
            )));
        }
        let path = self.object_path(content_hash);
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => {
                EvalError::Retrieval(format!("object {} not found", content_hash))
            }
            _ => EvalError::Retrieval(format!("failed to read object {}: {}", content_hash, e)),
        })
    }

    fn put(&self, bytes: &[u8]) -> Result<String> {
        let hash = sha256_hex(bytes);
        let path = self.object_path(&hash);
        if path.exists() {
            return Ok(hash);
        }

        let dir = self.root.join(&hash[..2]);
        fs::create_dir_all(&dir)
            .map_err(|e| EvalError::Retrieval(format!("cannot create {}: {}", dir.display(), e)))?;

        // Write-then-rename so readers never see a partial object
        let tmp = dir.join(format!(".{}.{}", hash, uuid::Uuid::new_v4()));
        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        };
        write().map_err(|e| {
            let _ = fs::remove_file(&tmp);
            EvalError::Retrieval(format!("failed to store object {}: {}", hash, e))
        })?;

        Ok(hash)
    }
}

/// In-memory store for tests and single-process runs
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn fetch(&self, content_hash: &str) -> Result<Vec<u8>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| EvalError::Retrieval("object map lock poisoned".to_string()))?;
        objects
            .get(content_hash)
            .cloned()
            .ok_or_else(|| EvalError::Retrieval(format!("object {} not found", content_hash)))
    }

    fn put(&self, bytes: &[u8]) -> Result<String> {
        let hash = sha256_hex(bytes);
        let mut objects = self
            .objects
            .write()
            .map_err(|_| EvalError::Retrieval("object map lock poisoned".to_string()))?;
        objects.entry(hash.clone()).or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert!(is_valid_hash(&sha256_hex(b"")));
        assert!(!is_valid_hash("ABC"));
    }

    #[test]
    fn test_fs_store_put_fetch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::open(dir.path()).expect("open");

        let hash = store.put(b"print('hi')").expect("put");
        assert_eq!(store.fetch(&hash).expect("fetch"), b"print('hi')");
        assert_eq!(store.put(b"print('hi')").expect("second put"), hash);
    }

    #[test]
    fn test_missing_and_malformed_objects_are_retrieval_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsObjectStore::open(dir.path()).expect("open");

        assert!(matches!(store.fetch("../etc/passwd"), Err(EvalError::Retrieval(_))));
        assert!(matches!(
            store.fetch(&sha256_hex(b"never stored")),
            Err(EvalError::Retrieval(_))
        ));
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryObjectStore::new();
        let hash = store.put(b"x").expect("put");
        assert_eq!(store.fetch(&hash).expect("fetch"), b"x");
        assert!(store.fetch("00").is_err());
    }
}
