//! Persistence (C5): atomic file storage with rotating backups and
//! backup-recovery-on-read, used for the proxy rule table, device
//! annotations, and the record table.
//!
//! A single reader-writer lock guards all operations on one [`Persistence`]
//! instance — writers are serialised and block readers, per the spec — and
//! every write goes through [`util::write_file_async`]'s
//! temp-file-then-rename primitive so a crash mid-write never corrupts the
//! target file.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;

use camino::{Utf8Path, Utf8PathBuf};
use jiff::{tz::TimeZone, Timestamp};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::inventory::{AnnotationStore, DeviceAnnotation, InventoryError};
use crate::proxy::{ProxyError, ProxyRule, RuleStore};
use crate::records::{RecordEntry, RecordError, RecordStore};
use crate::util;

//----------- Persistence --------------------------------------------------------

pub struct Persistence {
    path: Utf8PathBuf,
    keep_count: u8,
    lock: tokio::sync::RwLock<()>,
}

impl Persistence {
    pub fn new(path: Utf8PathBuf, keep_count: u8) -> Self {
        Self {
            path,
            keep_count,
            lock: tokio::sync::RwLock::new(()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    /// Read the current file's bytes, or `None` if it has never been
    /// written. On a read error (e.g. corruption), falls back to the most
    /// recent backup.
    pub async fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        let _guard = self.lock.read().await;

        match tokio::fs::read(&self.path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(_) => match self.most_recent_backup_path().await? {
                Some(backup) => tokio::fs::read(&backup)
                    .await
                    .map(Some)
                    .map_err(|err| PersistenceError::IOError(err.to_string())),
                None => Err(PersistenceError::IOError(
                    "primary file unreadable and no backup available".to_owned(),
                )),
            },
        }
    }

    /// Back up the current file (if present), write `contents` atomically,
    /// then prune backups beyond the configured keep-count.
    pub async fn write(&self, contents: &[u8]) -> Result<(), PersistenceError> {
        let _guard = self.lock.write().await;

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|err| PersistenceError::IOError(err.to_string()))?;
        }

        if let Ok(current) = tokio::fs::read(&self.path).await {
            let backup_path = self.backup_path_for_now();
            util::write_file_async(backup_path, current)
                .await
                .map_err(|err| PersistenceError::IOError(err.to_string()))?;
        }

        util::write_file_async(self.path.clone(), contents.to_vec())
            .await
            .map_err(|err| PersistenceError::IOError(err.to_string()))?;

        self.prune_backups().await
    }

    /// Backup filenames, newest-first by embedded timestamp.
    pub async fn list_backups(&self) -> Result<Vec<String>, PersistenceError> {
        let mut backups = self.backup_entries().await?;
        backups.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(backups.into_iter().map(|(_, name, _)| name).collect())
    }

    pub async fn storage_info(&self) -> Result<StorageInfo, PersistenceError> {
        Ok(StorageInfo {
            path: self.path.to_string(),
            exists: self.exists().await,
            backups: self.list_backups().await?,
        })
    }

    fn backup_prefix(&self) -> String {
        let name = self.path.file_name().unwrap_or("state");
        format!("{name}.backup.")
    }

    fn backup_path_for_now(&self) -> Utf8PathBuf {
        let timestamp = format_timestamp(Timestamp::now());
        let dir = self.path.parent().unwrap_or_else(|| Utf8Path::new("."));
        dir.join(format!("{}{timestamp}", self.backup_prefix()))
    }

    /// `(sort_key, filename, full_path)` for every backup sibling of this
    /// instance's file. The sort key is the embedded timestamp string,
    /// which sorts chronologically because it's fixed-width and zero-padded.
    async fn backup_entries(&self) -> Result<Vec<(String, String, Utf8PathBuf)>, PersistenceError> {
        let dir = self.path.parent().unwrap_or_else(|| Utf8Path::new("."));
        let prefix = self.backup_prefix();

        let mut entries = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(PersistenceError::IOError(err.to_string())),
        };

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|err| PersistenceError::IOError(err.to_string()))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if let Some(timestamp) = name.strip_prefix(&prefix) {
                let full_path = Utf8PathBuf::from_path_buf(entry.path())
                    .unwrap_or_else(|p| Utf8PathBuf::from(p.to_string_lossy().into_owned()));
                entries.push((timestamp.to_owned(), name, full_path));
            }
        }

        Ok(entries)
    }

    async fn most_recent_backup_path(&self) -> Result<Option<Utf8PathBuf>, PersistenceError> {
        let mut entries = self.backup_entries().await?;
        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().next().map(|(_, _, path)| path))
    }

    async fn prune_backups(&self) -> Result<(), PersistenceError> {
        let mut entries = self.backup_entries().await?;
        entries.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, _, path) in entries.into_iter().skip(self.keep_count as usize) {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|err| PersistenceError::IOError(err.to_string()))?;
        }
        Ok(())
    }
}

fn format_timestamp(ts: Timestamp) -> String {
    let zoned = ts.to_zoned(TimeZone::UTC);
    format!(
        "{:04}{:02}{:02}-{:02}{:02}{:02}",
        zoned.year(),
        zoned.month(),
        zoned.day(),
        zoned.hour(),
        zoned.minute(),
        zoned.second(),
    )
}

//----------- StorageInfo ---------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StorageInfo {
    pub path: String,
    pub exists: bool,
    pub backups: Vec<String>,
}

//----------- PersistenceError -----------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistenceError {
    IOError(String),
    SerializationError(String),
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IOError(msg) => write!(f, "persistence I/O error: {msg}"),
            Self::SerializationError(msg) => write!(f, "persistence serialization error: {msg}"),
        }
    }
}

impl std::error::Error for PersistenceError {}

//----------- JsonStore -------------------------------------------------------------

/// A [`Persistence`] instance specialised to a JSON-serialisable value,
/// defaulting to `T::default()` when nothing has been written yet.
pub struct JsonStore<T> {
    inner: Persistence,
    _marker: PhantomData<T>,
}

impl<T> JsonStore<T>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync,
{
    pub fn new(path: Utf8PathBuf, keep_count: u8) -> Self {
        Self {
            inner: Persistence::new(path, keep_count),
            _marker: PhantomData,
        }
    }

    pub async fn load_value(&self) -> T {
        match self.inner.read().await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes).unwrap_or_default(),
            _ => T::default(),
        }
    }

    pub async fn save_value(&self, value: &T) -> Result<(), PersistenceError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|err| PersistenceError::SerializationError(err.to_string()))?;
        self.inner.write(&bytes).await
    }
}

#[async_trait::async_trait]
impl AnnotationStore for JsonStore<HashMap<String, DeviceAnnotation>> {
    async fn load(&self) -> HashMap<String, DeviceAnnotation> {
        self.load_value().await
    }

    async fn save(&self, all: &HashMap<String, DeviceAnnotation>) -> Result<(), InventoryError> {
        self.save_value(all)
            .await
            .map_err(|err| InventoryError::IOError(err.to_string()))
    }

    async fn storage_info(&self) -> StorageInfo {
        self.inner.storage_info().await.unwrap_or_else(|_| StorageInfo {
            path: self.inner.path().to_string(),
            exists: false,
            backups: Vec::new(),
        })
    }
}

#[async_trait::async_trait]
impl RuleStore for JsonStore<HashMap<String, ProxyRule>> {
    async fn load(&self) -> HashMap<String, ProxyRule> {
        self.load_value().await
    }

    async fn save(&self, all: &HashMap<String, ProxyRule>) -> Result<(), ProxyError> {
        self.save_value(all)
            .await
            .map_err(|err| ProxyError::IOError(err.to_string()))
    }
}

#[async_trait::async_trait]
impl RecordStore for JsonStore<HashMap<String, RecordEntry>> {
    async fn load(&self) -> HashMap<String, RecordEntry> {
        self.load_value().await
    }

    async fn save(&self, all: &HashMap<String, RecordEntry>) -> Result<(), RecordError> {
        self.save_value(all).await.map_err(RecordError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("state.json")).unwrap();
        let store = Persistence::new(path, 3);

        assert_eq!(store.read().await.unwrap(), None);
        store.write(b"hello").await.unwrap();
        assert_eq!(store.read().await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn write_creates_a_backup_of_the_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("state.json")).unwrap();
        let store = Persistence::new(path, 5);

        store.write(b"v1").await.unwrap();
        store.write(b"v2").await.unwrap();

        let backups = store.list_backups().await.unwrap();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn prunes_backups_beyond_keep_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("state.json")).unwrap();
        let store = Persistence::new(path, 2);

        for i in 0..5u8 {
            store.write(format!("v{i}").as_bytes()).await.unwrap();
            // backups are keyed by embedded second-granularity timestamp;
            // force distinct timestamps so each write actually produces a
            // new backup instead of coalescing into the previous one.
            tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        }

        let backups = store.list_backups().await.unwrap();
        assert_eq!(backups.len(), 2);
        assert_eq!(store.read().await.unwrap(), Some(b"v4".to_vec()));
    }

    #[tokio::test]
    async fn storage_info_reports_path_and_existence() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("state.json")).unwrap();
        let store = Persistence::new(path, 2);

        let info = store.storage_info().await.unwrap();
        assert!(!info.exists);

        store.write(b"v1").await.unwrap();
        let info = store.storage_info().await.unwrap();
        assert!(info.exists);
    }

    #[tokio::test]
    async fn json_store_defaults_when_nothing_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("annotations.json")).unwrap();
        let store: JsonStore<HashMap<String, DeviceAnnotation>> = JsonStore::new(path, 2);
        let loaded = store.load_value().await;
        assert!(loaded.is_empty());
    }

    #[tokio::test]
    async fn json_store_round_trips_a_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("annotations.json")).unwrap();
        let store: JsonStore<HashMap<String, DeviceAnnotation>> = JsonStore::new(path, 2);

        let mut value = HashMap::new();
        value.insert(
            "device-1".to_owned(),
            DeviceAnnotation {
                dns_name: Some("chat.internal".to_owned()),
                description: None,
            },
        );
        store.save_value(&value).await.unwrap();

        let loaded = store.load_value().await;
        assert_eq!(loaded, value);
    }
}
