//! Persistence of the dashboard's activity record across reloads.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;

/// What survives a dashboard reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// Unix ms.
    pub last_activity_at: i64,
    /// Unix ms; `None` while no session counts toward the deadline.
    #[serde(default)]
    pub idle_deadline: Option<i64>,
    /// Sessions the deadline already covers. New ones re-arm it.
    #[serde(default)]
    pub session_ids: Vec<String>,
}

pub trait ActivityStore: Send + Sync {
    fn load(&self) -> Result<Option<ActivityRecord>>;
    fn save(&self, record: &ActivityRecord) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    record: Mutex<Option<ActivityRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: ActivityRecord) -> Self {
        Self {
            record: Mutex::new(Some(record)),
        }
    }
}

impl ActivityStore for MemoryStore {
    fn load(&self) -> Result<Option<ActivityRecord>> {
        let guard = self
            .record
            .lock()
            .map_err(|_| anyhow::anyhow!("activity store lock poisoned"))?;
        Ok(guard.clone())
    }

    fn save(&self, record: &ActivityRecord) -> Result<()> {
        let mut guard = self
            .record
            .lock()
            .map_err(|_| anyhow::anyhow!("activity store lock poisoned"))?;
        *guard = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut guard = self
            .record
            .lock()
            .map_err(|_| anyhow::anyhow!("activity store lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}

/// Record kept in a JSON file, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl ActivityStore for JsonFileStore {
    fn load(&self) -> Result<Option<ActivityRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading activity record {:?}", self.path))?;
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                log::warn!("Ignoring unreadable activity record {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }

    fn save(&self, record: &ActivityRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating directory {:?}", parent))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec(record).context("serializing activity record")?;
        std::fs::write(&tmp, json).with_context(|| format!("writing {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("replacing activity record {:?}", self.path))?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {:?}", self.path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record() -> ActivityRecord {
        ActivityRecord {
            last_activity_at: 1_000,
            idle_deadline: Some(1_801_000),
            session_ids: vec!["s1".to_string()],
        }
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("activity.json");

        let store = JsonFileStore::new(&path);
        assert_eq!(store.load().unwrap(), None);
        store.save(&record()).unwrap();

        let reopened = JsonFileStore::new(&path);
        assert_eq!(reopened.load().unwrap(), Some(record()));

        reopened.clear().unwrap();
        reopened.clear().unwrap();
        assert_eq!(reopened.load().unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("activity.json");
        std::fs::write(&path, "{ definitely not").unwrap();

        assert_eq!(JsonFileStore::new(&path).load().unwrap(), None);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        store.save(&record()).unwrap();
        assert_eq!(store.load().unwrap(), Some(record()));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
