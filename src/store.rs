//! Status persistence port.
//!
//! The poll loop only relies on `load`/`save`. A missing record loads as
//! `Idle`. `JsonFileStore` keeps one JSON file per entity and serializes
//! writers across processes with an advisory lock, so a `cancel` from a second
//! terminal cannot interleave with a poll loop's write.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::registration::status::RegistrationStatus;
use crate::registration::token::CorrelationToken;

const FILE_PREFIX: &str = "uat_registration_";
const LOCK_FILE: &str = ".lock";

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq)]
pub enum SaveOutcome {
    Saved,
    /// The stored record no longer belongs to the writer; it is returned as found.
    Rejected(RegistrationStatus),
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn load(&self, entity_id: &str) -> Result<RegistrationStatus, StoreError>;

    async fn save(&self, entity_id: &str, status: &RegistrationStatus) -> Result<(), StoreError>;

    /// Write `status` only if the stored record is still in progress under
    /// `token`. The check and the write happen under one lock.
    async fn save_if_owned(
        &self,
        entity_id: &str,
        token: &CorrelationToken,
        status: &RegistrationStatus,
    ) -> Result<SaveOutcome, StoreError>;

    /// Every persisted record, for resuming loops after a restart.
    async fn list(&self) -> Result<Vec<(String, RegistrationStatus)>, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    entity_id: String,
    status: RegistrationStatus,
}

/// File-backed store. Every call runs on tokio's blocking pool, since the
/// advisory lock and the file I/O are synchronous.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for an entity. Bytes outside `[A-Za-z0-9._-]` are
    /// percent-encoded, so distinct ids never share a file.
    pub fn path_for(&self, entity_id: &str) -> PathBuf {
        let mut safe = String::with_capacity(entity_id.len());
        for byte in entity_id.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.') {
                safe.push(char::from(byte));
            } else {
                safe.push_str(&format!("%{:02X}", byte));
            }
        }
        self.dir.join(format!("{}{}.json", FILE_PREFIX, safe))
    }

    fn io_err(path: &Path, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Run `f` on the blocking pool with the directory lock held.
    async fn call<F, R>(&self, exclusive: bool, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&JsonFileStore) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || {
            let lock = store.lock(exclusive)?;
            let result = f(&store);
            let _ = FileExt::unlock(&lock);
            result
        })
        .await?
    }

    fn lock(&self, exclusive: bool) -> Result<fs::File, StoreError> {
        fs::create_dir_all(&self.dir).map_err(|e| Self::io_err(&self.dir, e))?;
        let path = self.dir.join(LOCK_FILE);
        let file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| Self::io_err(&path, e))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            FileExt::lock_shared(&file)
        };
        locked.map_err(|e| Self::io_err(&path, e))?;
        Ok(file)
    }

    fn read_record(path: &Path, entity_id: &str) -> Result<Option<StoredRecord>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path).map_err(|e| Self::io_err(path, e))?;
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                entity_id: entity_id.to_string(),
                source,
            })
    }

    /// Caller holds the lock.
    fn read_status(&self, entity_id: &str) -> Result<RegistrationStatus, StoreError> {
        let path = self.path_for(entity_id);
        match Self::read_record(&path, entity_id)? {
            Some(record) if record.entity_id == entity_id => Ok(record.status),
            Some(record) => {
                tracing::warn!(
                    path = %path.display(),
                    expected = entity_id,
                    found = %record.entity_id,
                    "Status file belongs to another entity; treating as missing"
                );
                Ok(RegistrationStatus::Idle)
            }
            None => Ok(RegistrationStatus::Idle),
        }
    }

    /// Caller holds the exclusive lock.
    fn write_status(&self, entity_id: &str, status: &RegistrationStatus) -> Result<(), StoreError> {
        let record = StoredRecord {
            entity_id: entity_id.to_string(),
            status: status.clone(),
        };
        let json = serde_json::to_string_pretty(&record).map_err(|source| StoreError::Corrupt {
            entity_id: entity_id.to_string(),
            source,
        })?;
        let path = self.path_for(entity_id);
        let tmp = path.with_extension("json.tmp");
        fs::File::create(&tmp)
            .and_then(|mut f| f.write_all(json.as_bytes()))
            .and_then(|()| fs::rename(&tmp, &path))
            .map_err(|e| Self::io_err(&path, e))
    }

    fn list_records(&self) -> Result<Vec<(String, RegistrationStatus)>, StoreError> {
        let entries = fs::read_dir(&self.dir).map_err(|e| Self::io_err(&self.dir, e))?;
        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_err(&self.dir, e))?;
            let path = entry.path();
            let is_record = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(FILE_PREFIX) && n.ends_with(".json"));
            if !is_record {
                continue;
            }
            match Self::read_record(&path, &path.display().to_string()) {
                Ok(Some(record)) => records.push((record.entity_id, record.status)),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable status record"),
            }
        }
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }
}

#[async_trait]
impl StatusStore for JsonFileStore {
    async fn load(&self, entity_id: &str) -> Result<RegistrationStatus, StoreError> {
        let entity_id = entity_id.to_string();
        self.call(false, move |store| store.read_status(&entity_id))
            .await
    }

    async fn save(&self, entity_id: &str, status: &RegistrationStatus) -> Result<(), StoreError> {
        let entity_id = entity_id.to_string();
        let status = status.clone();
        self.call(true, move |store| store.write_status(&entity_id, &status))
            .await
    }

    async fn save_if_owned(
        &self,
        entity_id: &str,
        token: &CorrelationToken,
        status: &RegistrationStatus,
    ) -> Result<SaveOutcome, StoreError> {
        let entity_id = entity_id.to_string();
        let token = token.clone();
        let status = status.clone();
        self.call(true, move |store| {
            let current = store.read_status(&entity_id)?;
            if !current.is_owned_by(&token) {
                return Ok(SaveOutcome::Rejected(current));
            }
            store.write_status(&entity_id, &status)?;
            Ok(SaveOutcome::Saved)
        })
        .await
    }

    async fn list(&self) -> Result<Vec<(String, RegistrationStatus)>, StoreError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        self.call(false, |store| store.list_records()).await
    }
}

/// In-memory store for embedding and tests.
#[derive(Default)]
pub struct MemoryStatusStore {
    records: Mutex<HashMap<String, RegistrationStatus>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn load(&self, entity_id: &str) -> Result<RegistrationStatus, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        Ok(records.get(entity_id).cloned().unwrap_or_default())
    }

    async fn save(&self, entity_id: &str, status: &RegistrationStatus) -> Result<(), StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        records.insert(entity_id.to_string(), status.clone());
        Ok(())
    }

    async fn save_if_owned(
        &self,
        entity_id: &str,
        token: &CorrelationToken,
        status: &RegistrationStatus,
    ) -> Result<SaveOutcome, StoreError> {
        let mut records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        let current = records.get(entity_id).cloned().unwrap_or_default();
        if !current.is_owned_by(token) {
            return Ok(SaveOutcome::Rejected(current));
        }
        records.insert(entity_id.to_string(), status.clone());
        Ok(SaveOutcome::Saved)
    }

    async fn list(&self) -> Result<Vec<(String, RegistrationStatus)>, StoreError> {
        let records = self.records.lock().map_err(|_| StoreError::LockPoisoned)?;
        let mut all: Vec<_> = records
            .iter()
            .map(|(id, status)| (id.clone(), status.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(all)
    }
}
