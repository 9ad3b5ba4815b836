//! Durable keyed store.
//!
//! One [`KeyedStore`] handle is created per process and cloned into every
//! component that persists state. All access goes through a single mutex
//! around the backend, so reads and writes from different threads are
//! serialized.

pub mod backend;
pub mod cell;

pub use backend::{FileBackend, MemoryBackend, StoreBackend, STORE_FILE_VERSION};
pub use cell::DurableCell;

use crate::codec::{CodecError, PlistValue, PropertyListSerializable};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// Shared handle to one persistent key/value store.
#[derive(Clone)]
pub struct KeyedStore {
    backend: Arc<Mutex<Box<dyn StoreBackend>>>,
}

impl KeyedStore {
    /// Store backed by a JSON file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_backend(FileBackend::new(path))
    }

    pub fn in_memory() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    pub fn with_backend(backend: impl StoreBackend + 'static) -> Self {
        Self {
            backend: Arc::new(Mutex::new(Box::new(backend))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Box<dyn StoreBackend>> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The persisted JSON under `key`, exactly as stored.
    pub fn raw_json(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.lock().load(key)
    }

    /// The persisted value tree under `key`.
    pub fn raw(&self, key: &str) -> Result<Option<PlistValue>, StoreError> {
        match self.lock().load(key)? {
            Some(stored) => PlistValue::deserialize(&stored)
                .map(Some)
                .map_err(|e| StoreError::Malformed {
                    key: key.to_string(),
                    message: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Whole-store recovery performed when the backend was first read.
    pub fn recovery_warning(&self) -> Result<Option<LoadWarning>, StoreError> {
        self.lock().recovery()
    }

    /// Read `key`, falling back to (and persisting) `default`.
    pub fn read<T>(&self, key: &str, default: &T) -> Result<T, StoreError>
    where
        T: PropertyListSerializable + Clone,
    {
        Ok(self.read_reporting(key, default)?.value)
    }

    /// Like [`read`](Self::read), but also reports any recovery performed.
    ///
    /// A value that does not decode, or decodes only partially, is copied to
    /// a timestamped `<key>.corrupt.*` backup before the default or the
    /// cleaned value replaces it. Array elements that are not well-formed
    /// value trees count as dropped records.
    pub fn read_reporting<T>(&self, key: &str, default: &T) -> Result<Loaded<T>, StoreError>
    where
        T: PropertyListSerializable + Clone,
    {
        let mut guard = self.lock();
        let backend: &mut dyn StoreBackend = &mut **guard;

        let Some(stored) = backend.load(key)? else {
            save_tree(backend, key, &default.to_plist())?;
            return Ok(Loaded {
                value: default.clone(),
                warning: None,
            });
        };

        let (tree, unparsed) = parse_tree(&stored);
        let decoded = match &tree {
            Some(tree) => T::from_plist(tree)?,
            None => None,
        };

        match decoded {
            Some(value) if value.dropped_on_decode() + unparsed == 0 => Ok(Loaded {
                value,
                warning: None,
            }),
            Some(value) => {
                let dropped = value.dropped_on_decode() + unparsed;
                let backup_key = back_up(backend, key, stored)?;
                save_tree(backend, key, &value.to_plist())?;
                warn!(key, dropped, backup_key = %backup_key, "Dropped undecodable records");
                Ok(Loaded {
                    value,
                    warning: Some(LoadWarning::PartialLoad {
                        key: key.to_string(),
                        dropped,
                        backup_key,
                    }),
                })
            }
            None => {
                let backup_key = back_up(backend, key, stored)?;
                save_tree(backend, key, &default.to_plist())?;
                warn!(key, backup_key = %backup_key, "Stored value unreadable, reset to default");
                Ok(Loaded {
                    value: default.clone(),
                    warning: Some(LoadWarning::Unreadable {
                        key: key.to_string(),
                        backup_key,
                    }),
                })
            }
        }
    }

    /// Persist `value` under `key`.
    pub fn write<T: PropertyListSerializable>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        save_tree(&mut **self.lock(), key, &value.to_plist())
    }
}

fn save_tree(backend: &mut dyn StoreBackend, key: &str, tree: &PlistValue) -> Result<(), StoreError> {
    let stored = serde_json::to_value(tree).map_err(|e| StoreError::Serialize(e.to_string()))?;
    backend.save(key, stored)
}

/// Copy `stored` under a fresh backup key and return that key.
fn back_up(backend: &mut dyn StoreBackend, key: &str, stored: Value) -> Result<String, StoreError> {
    let mut failure = None;
    let backup_key = backend::backup_name(key, |name| match backend.load(name) {
        Ok(existing) => existing.is_some(),
        Err(e) => {
            failure = Some(e);
            false
        }
    });
    if let Some(e) = failure {
        return Err(e);
    }
    backend.save(&backup_key, stored)?;
    Ok(backup_key)
}

/// Parse a persisted value, keeping the well-formed elements of an array.
///
/// Returns the tree and how many array elements were left out.
fn parse_tree(stored: &Value) -> (Option<PlistValue>, usize) {
    if let Ok(tree) = PlistValue::deserialize(stored) {
        return (Some(tree), 0);
    }

    let Some(items) = stored.get("array").and_then(Value::as_array) else {
        return (None, 0);
    };
    let mut unparsed = 0;
    let kept = items
        .iter()
        .filter_map(|item| match PlistValue::deserialize(item) {
            Ok(tree) => Some(tree),
            Err(_) => {
                unparsed += 1;
                None
            }
        })
        .collect();
    (Some(PlistValue::Array(kept)), unparsed)
}

/// Result of a reporting read.
#[derive(Debug, Clone, PartialEq)]
pub struct Loaded<T> {
    pub value: T,
    pub warning: Option<LoadWarning>,
}

/// Recovery performed while loading persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadWarning {
    /// The value could not be decoded at all and was reset to its default.
    Unreadable { key: String, backup_key: String },
    /// Some records could not be decoded and were removed.
    PartialLoad {
        key: String,
        dropped: usize,
        backup_key: String,
    },
    /// The store file itself could not be read; every key started empty.
    StoreFileQuarantined {
        path: PathBuf,
        moved_to: PathBuf,
        reason: String,
    },
}

impl std::fmt::Display for LoadWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadWarning::Unreadable { key, backup_key } => write!(
                f,
                "'{key}' could not be read and was reset; the original was kept under '{backup_key}'"
            ),
            LoadWarning::PartialLoad {
                key,
                dropped,
                backup_key,
            } => write!(
                f,
                "{dropped} record(s) in '{key}' could not be read; the original was kept under '{backup_key}'"
            ),
            LoadWarning::StoreFileQuarantined {
                path,
                moved_to,
                reason,
            } => write!(
                f,
                "store file {} could not be read ({reason}) and was moved to {}; all state started empty",
                path.display(),
                moved_to.display()
            ),
        }
    }
}

/// Store errors.
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    Serialize(String),
    Codec(CodecError),
    /// A persisted entry is not a well-formed value tree.
    Malformed { key: String, message: String },
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Store IO error: {e}"),
            StoreError::Serialize(e) => write!(f, "Store serialize error: {e}"),
            StoreError::Codec(e) => write!(f, "Store decode error: {e}"),
            StoreError::Malformed { key, message } => {
                write!(f, "Store entry '{key}' is malformed: {message}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Io(e) => Some(e),
            StoreError::Codec(e) => Some(e),
            StoreError::Serialize(_) | StoreError::Malformed { .. } => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<CodecError> for StoreError {
    fn from(e: CodecError) -> Self {
        StoreError::Codec(e)
    }
}
