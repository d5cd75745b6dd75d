use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

pub const MAX_KEY_LENGTH: usize = 200;
pub const MAX_VALUE_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KvKey {
    namespace: KeyNamespace,
    key: String,
}

impl KvKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, KvError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), KvError> {
        if key.is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(KvError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.trim().is_empty() {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be only whitespace".to_string(),
            });
        }

        if key.contains('\0') {
            return Err(KvError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key cannot contain null bytes".to_string(),
            });
        }

        if key.contains("..") {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        // Keys double as file names in `FileKv`; dot-prefixed names are its temp files.
        if key.starts_with('.') {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot start with '.'".to_string(),
            });
        }

        if key.contains(['/', '\\', ':']) {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path or namespace separators".to_string(),
            });
        }

        if key.chars().any(char::is_control) {
            return Err(KvError::InvalidKey {
                key: key.to_string(),
                reason: "key contains invalid control characters".to_string(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyNamespace {
    Queue,
    DeadLetter,
    Quarantine,
    Capture,
}

impl KeyNamespace {
    pub fn prefix(&self) -> &'static str {
        match self {
            KeyNamespace::Queue => "queue",
            KeyNamespace::DeadLetter => "dead-letter",
            KeyNamespace::Quarantine => "quarantine",
            KeyNamespace::Capture => "capture",
        }
    }
}

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum KvError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("value too large: {size} bytes exceeds maximum of {max} bytes")]
    ValueTooLarge { size: usize, max: usize },

    #[error("storage error: {message} (code: {code:?}, retryable: {retryable})")]
    Storage {
        code: StorageErrorCode,
        message: String,
        retryable: bool,
    },
}

impl KvError {
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::Storage { retryable, .. } => *retryable,
            _ => false,
        }
    }

    pub fn storage(code: StorageErrorCode, message: impl Into<String>) -> Self {
        let retryable = code.is_retryable();
        Self::Storage {
            code,
            message: message.into(),
            retryable,
        }
    }
}

impl From<io::Error> for KvError {
    fn from(e: io::Error) -> Self {
        let code = match e.kind() {
            io::ErrorKind::PermissionDenied => StorageErrorCode::PermissionDenied,
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => StorageErrorCode::Busy,
            _ => StorageErrorCode::IoError,
        };
        KvError::storage(code, e.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageErrorCode {
    Unknown,
    ConnectionFailed,
    Corrupted,
    DiskFull,
    PermissionDenied,
    Busy,
    Locked,
    IoError,
}

impl StorageErrorCode {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageErrorCode::ConnectionFailed | StorageErrorCode::Busy | StorageErrorCode::Locked
        )
    }
}

fn check_value_size(value: &[u8]) -> Result<(), KvError> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(KvError::ValueTooLarge {
            size: value.len(),
            max: MAX_VALUE_SIZE,
        });
    }
    Ok(())
}

/// String-keyed durable store.
///
/// `set` and `delete` return only after the change is durable; callers rely on
/// this to close the window between a user action and its persistence.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError>;
    async fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError>;
    /// Returns whether the key existed.
    async fn delete(&self, key: &KvKey) -> Result<bool, KvError>;
    /// All keys in `namespace`, ascending.
    async fn list(&self, namespace: &KeyNamespace) -> Result<Vec<KvKey>, KvError>;
}

/// Process-local store. Clones share the same entries, which lets tests model
/// an application restart by building fresh components over a clone.
#[derive(Debug, Clone, Default)]
pub struct MemoryKv {
    entries: Arc<Mutex<BTreeMap<KvKey, Vec<u8>>>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<KvKey, Vec<u8>>) -> T,
    ) -> Result<T, KvError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| KvError::storage(StorageErrorCode::Locked, "memory store lock poisoned"))?;
        Ok(f(&mut entries))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        self.with_entries(|entries| entries.get(key).cloned())
    }

    async fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        check_value_size(value)?;
        self.with_entries(|entries| {
            entries.insert(key.clone(), value.to_vec());
        })
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        self.with_entries(|entries| entries.remove(key).is_some())
    }

    async fn list(&self, namespace: &KeyNamespace) -> Result<Vec<KvKey>, KvError> {
        self.with_entries(|entries| {
            entries
                .keys()
                .filter(|key| key.namespace() == namespace)
                .cloned()
                .collect()
        })
    }
}

/// Runs blocking storage work on tokio's blocking pool.
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T, KvError>
where
    F: FnOnce() -> Result<T, KvError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|e| {
        KvError::storage(StorageErrorCode::Unknown, format!("storage task failed: {e}"))
    })?
}

/// One file per key under `<root>/<namespace>/`, written atomically
/// (temp file, fsync, rename, directory fsync). File I/O runs on the
/// blocking pool, so the store is safe on any runtime flavor.
#[derive(Debug, Clone)]
pub struct FileKv {
    root: PathBuf,
}

impl FileKv {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, KvError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn namespace_dir(&self, namespace: &KeyNamespace) -> PathBuf {
        self.root.join(namespace.prefix())
    }

    fn path_for(&self, key: &KvKey) -> PathBuf {
        self.namespace_dir(key.namespace()).join(key.key())
    }
}

fn sync_dir(dir: &Path) {
    if let Ok(dir) = File::open(dir) {
        let _ = dir.sync_all();
    }
}

fn read_file(path: &Path) -> Result<Option<Vec<u8>>, KvError> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn write_atomic(dir: &Path, name: &str, value: &[u8]) -> Result<(), KvError> {
    fs::create_dir_all(dir)?;

    let path = dir.join(name);
    let tmp_path = dir.join(format!(".{name}.tmp"));

    let mut file = File::create(&tmp_path)?;
    file.write_all(value)?;
    file.sync_all()?;

    fs::rename(&tmp_path, &path)?;
    sync_dir(dir);
    Ok(())
}

fn remove_file(path: &Path) -> Result<bool, KvError> {
    match fs::remove_file(path) {
        Ok(()) => {
            if let Some(parent) = path.parent() {
                sync_dir(parent);
            }
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn list_dir(dir: &Path, namespace: &KeyNamespace) -> Result<Vec<KvKey>, KvError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut keys = Vec::new();
    for entry in read_dir {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            warn!("Skipping non UTF-8 file in {}", dir.display());
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        match KvKey::new(namespace.clone(), name) {
            Ok(key) => keys.push(key),
            Err(e) => warn!("Skipping foreign file in {}: {}", dir.display(), e),
        }
    }
    keys.sort();
    Ok(keys)
}

#[async_trait]
impl KvStore for FileKv {
    async fn get(&self, key: &KvKey) -> Result<Option<Vec<u8>>, KvError> {
        let path = self.path_for(key);
        run_blocking(move || read_file(&path)).await
    }

    async fn set(&self, key: &KvKey, value: &[u8]) -> Result<(), KvError> {
        check_value_size(value)?;

        let dir = self.namespace_dir(key.namespace());
        let name = key.key().to_string();
        let value = value.to_vec();
        run_blocking(move || write_atomic(&dir, &name, &value)).await
    }

    async fn delete(&self, key: &KvKey) -> Result<bool, KvError> {
        let path = self.path_for(key);
        run_blocking(move || remove_file(&path)).await
    }

    async fn list(&self, namespace: &KeyNamespace) -> Result<Vec<KvKey>, KvError> {
        let dir = self.namespace_dir(namespace);
        let namespace = namespace.clone();
        run_blocking(move || list_dir(&dir, &namespace)).await
    }
}
