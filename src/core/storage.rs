//! Durable key/value backends for the persistent cache.
//!
//! The cache only needs `get`/`set` over `(namespace, key)` pairs, so any
//! platform store (preferences API, keychain, a file) can be adapted by
//! implementing [`StorageBackend`]. Two implementations ship with the crate:
//!
//! - [`InMemoryStorage`] keeps everything in a map; useful for tests and for
//!   hosts without a writable disk.
//! - [`FileStorage`] keeps one directory per namespace and one file per key.

use fs2::FileExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::StorageError;

const LOCK_FILE_NAME: &str = ".lock";
const TEMP_SUFFIX: &str = ".tmp";
const DATA_SUFFIX: &str = ".data";

/// Simple durable key/value surface.
///
/// Implementations must be safe to call from several threads; the cache
/// serializes its own writes but reads may happen concurrently.
pub trait StorageBackend: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError>;

    /// Stores `value` under `key`; `None` removes the key.
    fn set(&self, namespace: &str, key: &str, value: Option<&str>) -> Result<(), StorageError>;
}

#[derive(Default)]
pub struct InMemoryStorage {
    data: Mutex<HashMap<(String, String), String>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }
}

impl StorageBackend for InMemoryStorage {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        let data = self.data.lock();
        Ok(data.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    fn set(&self, namespace: &str, key: &str, value: Option<&str>) -> Result<(), StorageError> {
        let mut data = self.data.lock();
        let entry = (namespace.to_string(), key.to_string());
        match value {
            Some(value) => {
                data.insert(entry, value.to_string());
            }
            None => {
                data.remove(&entry);
            }
        }
        Ok(())
    }
}

/// File-per-key storage rooted at a directory.
///
/// Writes go to a temporary file that is renamed over the target, so a crash
/// mid-write leaves the previous value intact. An advisory lock on
/// `<namespace>/.lock` keeps two processes sharing the directory from
/// interleaving writes.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Creates the storage, creating `root` if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: &str) -> PathBuf {
        self.root.join(encode_file_name(namespace))
    }

    fn acquire_lock(&self, dir: &Path) -> Result<File, StorageError> {
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE_NAME))?;
        lock_file.lock_exclusive()?;
        Ok(lock_file)
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.namespace_dir(namespace).join(data_file_name(key));
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn set(&self, namespace: &str, key: &str, value: Option<&str>) -> Result<(), StorageError> {
        let dir = self.namespace_dir(namespace);
        fs::create_dir_all(&dir)?;

        let lock = self.acquire_lock(&dir)?;
        let path = dir.join(data_file_name(key));

        let result = match value {
            Some(value) => write_atomically(&path, value),
            None => match fs::remove_file(&path) {
                Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
                _ => Ok(()),
            },
        };

        // Lock released on drop, but surface unlock failures in the log.
        if let Err(e) = lock.unlock() {
            tracing::debug!("Failed to release storage lock in {}: {}", dir.display(), e);
        }

        result
    }
}

fn write_atomically(path: &Path, value: &str) -> Result<(), StorageError> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(TEMP_SUFFIX);
    let temp_path = PathBuf::from(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(value.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// File holding the value of `key`. The suffix keeps keys apart from the
/// lock file and from temporary files.
fn data_file_name(key: &str) -> String {
    format!("{}{}", encode_file_name(key), DATA_SUFFIX)
}

/// Percent-encodes anything that is not safe in a file name.
fn encode_file_name(name: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(name.as_bytes()).collect();
    // form encoding leaves '.' and '*' alone; a bare "." or ".." must not escape the root
    match encoded.as_str() {
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => encoded,
    }
}
