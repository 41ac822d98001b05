//! File-backed key-value store.
//!
//! The whole key space is held in memory and mirrored to a single JSON file.
//! Every mutation rewrites the file through a temp file followed by an atomic
//! rename, so a crash leaves either the old or the new image on disk.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info};

use super::backend::{KvStore, Lookup, StoreError};

/// Durable store persisted to a single file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl FileStore {
    /// Open the store at `path`. A missing file yields an empty store; the
    /// file is created on the first write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read(&path) {
            Ok(raw) => decode_image(&raw)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        info!(path = %path.display(), keys = entries.len(), "Opened file store");

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Apply `mutate` to a copy of the map, persist the copy, then publish it.
    ///
    /// The write lock is held across the file write so concurrent mutations
    /// reach disk in the same order they are applied in memory.
    fn mutate<F>(&self, mutate: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<Vec<u8>, Vec<u8>>),
    {
        let mut entries = self.entries.write();
        let mut next = entries.clone();
        mutate(&mut next);
        self.write_image(&next)?;
        *entries = next;
        Ok(())
    }

    fn write_image(&self, entries: &BTreeMap<Vec<u8>, Vec<u8>>) -> Result<(), StoreError> {
        let pairs: Vec<(&Vec<u8>, &Vec<u8>)> = entries.iter().collect();
        let bytes =
            serde_json::to_vec(&pairs).map_err(|e| StoreError::Serialization(e.to_string()))?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        fs::write(&tmp_path, &bytes)?;
        fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "Wrote store image");
        Ok(())
    }
}

fn decode_image(raw: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>, StoreError> {
    if raw.is_empty() {
        return Ok(BTreeMap::new());
    }
    let pairs: Vec<(Vec<u8>, Vec<u8>)> =
        serde_json::from_slice(raw).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(pairs.into_iter().collect())
}

impl KvStore for FileStore {
    fn get(&self, key: &[u8]) -> Result<Lookup, StoreError> {
        Ok(match self.entries.read().get(key) {
            Some(value) => Lookup::Found(value.clone()),
            None => Lookup::NotFound,
        })
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.mutate(|entries| {
            entries.insert(key.to_vec(), value.to_vec());
        })
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        if !self.entries.read().contains_key(key) {
            return Ok(());
        }
        self.mutate(|entries| {
            entries.remove(key);
        })
    }
}
