//! Simple key-value store: one JSON document per key on disk.

use crate::storage::StorageError;
use crate::storage::StoreArea;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const PROBE_FILE: &str = ".probe";

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root` and confirm it is writable.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let store = Self { root };
        store.write_atomic(&store.root.join(PROBE_FILE), b"ok")?;
        Ok(store)
    }

    pub fn get(&self, area: StoreArea, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(area, key)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write a value. The new contents replace the old ones in a single rename.
    pub fn put(&self, area: StoreArea, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(area, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        self.write_atomic(&path, value.as_bytes())
    }

    pub fn remove(&self, area: StoreArea, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(area, key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn path_for(&self, area: StoreArea, key: &str) -> PathBuf {
        self.root
            .join(area.name())
            .join(format!("{}.json", sanitize_key(key)))
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| StorageError::Unsupported(format!("invalid path {:?}", path)))?;
        let tmp = path.with_file_name(format!(".{}.tmp", file_name));

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Keys become file names; anything outside `[A-Za-z0-9_-]` is replaced.
fn sanitize_key(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
