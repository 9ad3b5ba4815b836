//! Storage backends for the keyed store.
//!
//! # File format
//!
//! ```json
//! {
//!   "version": 1,
//!   "entries": {
//!     "sensor_sample_events": { "array": [ ... ] },
//!     "events_received_while_in_background": { "integer": 0 }
//!   }
//! }
//! ```
//!
//! Backends hold each entry in its JSON form. Turning an entry into a value
//! tree is left to the store, so one malformed entry never hides the others.
//!
//! Writes go to a temp file in the same directory, which is synced and
//! persisted over the store file before `save` returns.

use super::{LoadWarning, StoreError};
use crate::codec::PlistValue;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

/// Version of the store file layout.
pub const STORE_FILE_VERSION: u32 = 1;

/// A place where keyed values are persisted.
pub trait StoreBackend: Send {
    /// The persisted form of `key`, as last saved.
    fn load(&mut self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Persist `value` under `key`. Must not return before the value is durable.
    fn save(&mut self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Whole-store recovery performed when the backend was first read.
    fn recovery(&mut self) -> Result<Option<LoadWarning>, StoreError> {
        Ok(None)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    entries: BTreeMap<String, Value>,
}

/// JSON file holding every key of one store.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    entries: Option<BTreeMap<String, Value>>,
    quarantined: Option<LoadWarning>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: None,
            quarantined: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries currently on disk, read once and then kept in memory.
    fn loaded(&mut self) -> Result<&BTreeMap<String, Value>, StoreError> {
        if self.entries.is_none() {
            let (entries, quarantined) = read_store_file(&self.path)?;
            self.entries = Some(entries);
            self.quarantined = quarantined;
        }
        Ok(self.entries.get_or_insert_with(BTreeMap::new))
    }
}

impl StoreBackend for FileBackend {
    fn load(&mut self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.loaded()?.get(key).cloned())
    }

    fn save(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        let mut next = self.loaded()?.clone();
        next.insert(key.to_string(), value);
        write_store_file(&self.path, &next)?;
        self.entries = Some(next);
        Ok(())
    }

    fn recovery(&mut self) -> Result<Option<LoadWarning>, StoreError> {
        self.loaded()?;
        Ok(self.quarantined.clone())
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Timestamped name for a backup, unique among `taken`.
pub(crate) fn backup_name(base: &str, mut taken: impl FnMut(&str) -> bool) -> String {
    let stamped = format!("{base}.corrupt.{}", Utc::now().format("%Y%m%d_%H%M%S"));
    let mut candidate = stamped.clone();
    let mut n = 1;
    while taken(&candidate) {
        candidate = format!("{stamped}-{n}");
        n += 1;
    }
    candidate
}

fn read_store_file(
    path: &Path,
) -> Result<(BTreeMap<String, Value>, Option<LoadWarning>), StoreError> {
    if !path.exists() {
        return Ok((BTreeMap::new(), None));
    }

    let content = std::fs::read_to_string(path)?;
    if content.trim().is_empty() {
        return Ok((BTreeMap::new(), None));
    }

    let reason = match serde_json::from_str::<StoreFile>(&content) {
        Ok(file) if file.version == STORE_FILE_VERSION => return Ok((file.entries, None)),
        Ok(file) => format!("unsupported store version {}", file.version),
        Err(e) => e.to_string(),
    };
    let warning = quarantine(path, reason)?;
    Ok((BTreeMap::new(), Some(warning)))
}

/// Move an unreadable store file aside so the next write cannot clobber it.
fn quarantine(path: &Path, reason: String) -> Result<LoadWarning, StoreError> {
    let name = path.as_os_str().to_string_lossy().into_owned();
    let aside = PathBuf::from(backup_name(&name, |candidate| Path::new(candidate).exists()));
    std::fs::rename(path, &aside)?;
    warn!(
        path = %path.display(),
        moved_to = %aside.display(),
        reason = %reason,
        "Store file unreadable, starting empty"
    );
    Ok(LoadWarning::StoreFileQuarantined {
        path: path.to_path_buf(),
        moved_to: aside,
        reason,
    })
}

fn write_store_file(path: &Path, entries: &BTreeMap<String, Value>) -> Result<(), StoreError> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;

    let file = StoreFile {
        version: STORE_FILE_VERSION,
        entries: entries.clone(),
    };
    let json =
        serde_json::to_string_pretty(&file).map_err(|e| StoreError::Serialize(e.to_string()))?;

    let mut tmp = NamedTempFile::new_in(parent)?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

/// Volatile backend for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: BTreeMap<String, Value>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a value tree, bypassing the codec.
    pub fn with_entry(self, key: impl Into<String>, value: PlistValue) -> Self {
        // Serializing a value tree into JSON cannot fail.
        self.with_raw_entry(key, serde_json::to_value(&value).unwrap_or_default())
    }

    /// Seed the persisted JSON form directly.
    pub fn with_raw_entry(mut self, key: impl Into<String>, value: Value) -> Self {
        self.entries.insert(key.into(), value);
        self
    }
}

impl StoreBackend for MemoryBackend {
    fn load(&mut self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.get(key).cloned())
    }

    fn save(&mut self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn integer(n: i64) -> Value {
        json!({ "integer": n })
    }

    #[test]
    fn test_file_backend_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("store.json");

        let mut backend = FileBackend::new(&path);
        backend.save("count", integer(3)).unwrap();
        assert!(path.exists());
        let files = std::fs::read_dir(path.parent().unwrap()).unwrap().count();
        assert_eq!(files, 1, "temp file left behind");

        let mut reopened = FileBackend::new(&path);
        assert_eq!(reopened.load("count").unwrap(), Some(integer(3)));
        assert_eq!(reopened.load("missing").unwrap(), None);
        assert_eq!(reopened.recovery().unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, "{ not json").unwrap();

        let mut backend = FileBackend::new(&path);
        assert_eq!(backend.load("anything").unwrap(), None);

        let Some(LoadWarning::StoreFileQuarantined { moved_to, .. }) = backend.recovery().unwrap()
        else {
            panic!("quarantine not reported");
        };
        assert!(moved_to.exists());
        assert!(moved_to.to_string_lossy().contains("store.json.corrupt."));

        backend.save("k", json!({ "boolean": true })).unwrap();
        let kept = std::fs::read_to_string(&moved_to).unwrap();
        assert_eq!(kept, "{ not json");
    }

    #[test]
    fn test_repeated_corruption_keeps_every_backup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let mut moved = Vec::new();
        for content in ["first", "second"] {
            std::fs::write(&path, content).unwrap();
            let mut backend = FileBackend::new(&path);
            match backend.recovery().unwrap() {
                Some(LoadWarning::StoreFileQuarantined { moved_to, .. }) => moved.push(moved_to),
                other => panic!("unexpected recovery {other:?}"),
            }
        }

        assert_ne!(moved[0], moved[1]);
        assert_eq!(std::fs::read_to_string(&moved[0]).unwrap(), "first");
        assert_eq!(std::fs::read_to_string(&moved[1]).unwrap(), "second");
    }

    #[test]
    fn test_malformed_entry_leaves_other_keys_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");
        let file = json!({
            "version": STORE_FILE_VERSION,
            "entries": {
                "count": { "integer": 7 },
                "log": { "data": "AAAA" }
            }
        });
        std::fs::write(&path, file.to_string()).unwrap();

        let mut backend = FileBackend::new(&path);
        assert_eq!(backend.recovery().unwrap(), None);
        assert_eq!(backend.load("count").unwrap(), Some(integer(7)));
        assert_eq!(backend.load("log").unwrap(), Some(json!({ "data": "AAAA" })));
    }

    #[test]
    fn test_backup_name_skips_taken_names() {
        let first = backup_name("log", |_| false);
        assert!(first.starts_with("log.corrupt."));

        let second = backup_name("log", |candidate| !candidate.contains('-'));
        assert!(second.starts_with("log.corrupt."));
        assert!(second.ends_with("-1"));
    }

    #[test]
    fn test_memory_backend() {
        let mut backend = MemoryBackend::new().with_entry("a", PlistValue::Integer(1));
        assert_eq!(backend.load("a").unwrap(), Some(integer(1)));
        backend.save("a", integer(2)).unwrap();
        assert_eq!(backend.load("a").unwrap(), Some(integer(2)));
        assert_eq!(backend.recovery().unwrap(), None);
    }
}
