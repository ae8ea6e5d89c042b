//! JSON file backed [`RecordStore`].
//!
//! The whole registry is one pretty-printed JSON array rewritten atomically on every
//! mutation: temp file in the same directory, fsync, rename, fsync of the directory.
//! A sidecar `.lock` file held with an exclusive `fs2` lock keeps two processes from
//! interleaving writes.

use fs2::FileExt;
use log::{debug, warn};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::runtime::RuntimeFlavor;

use super::{apply_default, apply_update, ConnectionRecord, RecordId, RecordStore};
use crate::error::RegistryError;

pub struct JsonRecordStore {
    path: PathBuf,
    records: Mutex<Vec<ConnectionRecord>>,
}

impl JsonRecordStore {
    /// Opens (or starts) the registry at `path`, hydrating every record to a non-active status.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let mut records: Vec<ConnectionRecord> = match fs::read_to_string(&path) {
            Ok(content) => {
                // Guard against leading NULs left by an interrupted write
                let cleaned = content.trim_start_matches('\0').trim();
                if cleaned.is_empty() {
                    Vec::new()
                } else {
                    serde_json::from_str(cleaned)?
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No registry at {}, starting empty", path.display());
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        for record in records.iter_mut() {
            record.hydrate();
        }
        debug!("Loaded {} connection records from {}", records.len(), path.display());
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the current records, creating the file if needed.
    pub fn save(&self) -> Result<(), RegistryError> {
        let records = self.lock();
        self.persist(&records)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ConnectionRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, records: &[ConnectionRecord]) -> Result<(), RegistryError> {
        let content = serde_json::to_string_pretty(records)?;
        off_runtime(|| write_file_locked(&self.path, &content))
    }

    /// Runs `mutate` under the in-memory lock and persists on success. On a failed write
    /// the in-memory copy is rolled back so memory never runs ahead of disk.
    fn mutate<T>(
        &self,
        mutate: impl FnOnce(&mut Vec<ConnectionRecord>) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut records = self.lock();
        let snapshot = records.clone();
        let out = mutate(&mut records)?;
        if let Err(e) = self.persist(&records) {
            warn!("Registry write to {} failed: {}", self.path.display(), e);
            *records = snapshot;
            return Err(e);
        }
        Ok(out)
    }
}

impl RecordStore for JsonRecordStore {
    fn list(&self) -> Vec<ConnectionRecord> {
        self.lock().clone()
    }

    fn get(&self, id: RecordId) -> Option<ConnectionRecord> {
        self.lock().iter().find(|r| r.id == id).cloned()
    }

    fn insert(&self, record: ConnectionRecord) -> Result<(), RegistryError> {
        self.mutate(|records| {
            if records.iter().any(|r| r.id == record.id) {
                return Err(RegistryError::Duplicate(record.id));
            }
            records.push(record);
            Ok(())
        })
    }

    fn update(
        &self,
        id: RecordId,
        apply: &mut dyn FnMut(&mut ConnectionRecord),
    ) -> Result<ConnectionRecord, RegistryError> {
        self.mutate(|records| apply_update(records, id, apply))
    }

    fn update_retained(
        &self,
        id: RecordId,
        apply: &mut dyn FnMut(&mut ConnectionRecord),
    ) -> Result<ConnectionRecord, RegistryError> {
        let mut records = self.lock();
        let updated = apply_update(&mut records, id, apply)?;
        if let Err(e) = self.persist(&records) {
            warn!(
                "Registry write to {} failed, keeping {} in memory: {}",
                self.path.display(),
                id,
                e
            );
        }
        Ok(updated)
    }

    fn remove(&self, id: RecordId) -> Result<bool, RegistryError> {
        self.mutate(|records| {
            let before = records.len();
            records.retain(|r| r.id != id);
            Ok(records.len() != before)
        })
    }

    fn set_default(&self, id: RecordId) -> Result<(), RegistryError> {
        self.mutate(|records| apply_default(records, id))
    }
}

/// Runs blocking file work; on a multi-threaded runtime the other tasks move off this thread.
fn off_runtime<T>(work: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

/// Atomic replace of `path` with `content`, serialized across processes by a sidecar lock.
fn write_file_locked(path: &Path, content: &str) -> Result<(), RegistryError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;
    let base = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("connections.json");

    // fs2 has no async API; callers go through `off_runtime`
    let lock_file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(dir.join(format!(".{}.lock", base)))?;
    lock_file.lock_exclusive()?;

    let mut counter = 0u32;
    let (tmp_path, tmp) = loop {
        let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(file) => break (candidate, file),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                counter = counter.saturating_add(1);
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    };

    let written = fill(tmp, content).and_then(|_| fs::rename(&tmp_path, path));
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    if let Ok(dir_file) = File::open(&dir) {
        let _ = dir_file.sync_all();
    }
    let _ = lock_file.unlock();
    Ok(())
}

fn fill(mut file: File, content: &str) -> io::Result<()> {
    file.write_all(content.as_bytes())?;
    file.flush()?;
    let _ = file.sync_all();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionStatus, Endpoint};

    fn record(name: &str) -> ConnectionRecord {
        ConnectionRecord::new(
            name,
            Endpoint::Network {
                host: format!("{}.local", name),
                tls: false,
            },
        )
    }

    #[test]
    fn round_trips_through_disk_and_hydrates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("connections.json");
        let rec = record("roof");
        {
            let store = JsonRecordStore::open(&path).unwrap();
            store.insert(rec.clone()).unwrap();
            store
                .update(rec.id, &mut |r| {
                    r.status = ConnectionStatus::Configured;
                    r.live_session_id = Some(uuid::Uuid::new_v4());
                    r.node_num = Some(0x1234abcd);
                })
                .unwrap();
            store.set_default(rec.id).unwrap();
        }
        let reopened = JsonRecordStore::open(&path).unwrap();
        let loaded = reopened.get(rec.id).unwrap();
        assert_eq!(loaded.status, ConnectionStatus::Disconnected);
        assert!(loaded.live_session_id.is_none());
        assert!(loaded.is_default);
        assert_eq!(loaded.node_num, Some(0x1234abcd));
    }

    #[test]
    fn missing_and_empty_files_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        assert!(JsonRecordStore::open(&path).unwrap().list().is_empty());
        std::fs::write(&path, "\0\0\n").unwrap();
        assert!(JsonRecordStore::open(&path).unwrap().list().is_empty());
    }

    #[test]
    fn corrupt_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            JsonRecordStore::open(&path),
            Err(RegistryError::Json(_))
        ));
    }

    #[test]
    fn unwritable_registry_rolls_back_updates_but_keeps_retained_ones() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let path = data.join("connections.json");
        let store = JsonRecordStore::open(&path).unwrap();
        let rec = record("attic");
        store.insert(rec.clone()).unwrap();
        store
            .update(rec.id, &mut |r| {
                r.status = ConnectionStatus::Connected;
                r.live_session_id = Some(uuid::Uuid::new_v4());
            })
            .unwrap();

        std::fs::remove_dir_all(&data).unwrap();
        std::fs::write(&data, "not a directory").unwrap();

        assert!(store
            .update(rec.id, &mut |r| r.name = "renamed".into())
            .is_err());
        assert_eq!(store.get(rec.id).unwrap().name, "attic");

        let demoted = store
            .update_retained(rec.id, &mut |r| {
                r.status = ConnectionStatus::Disconnected;
                r.live_session_id = None;
            })
            .unwrap();
        assert_eq!(demoted.status, ConnectionStatus::Disconnected);
        let held = store.get(rec.id).unwrap();
        assert!(held.is_consistent());
        assert!(held.live_session_id.is_none());
    }

    #[test]
    fn failed_replace_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        // A non-empty directory where the registry file should be
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("keep"), "x").unwrap();

        assert!(write_file_locked(&path, "[]").is_err());
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains(".tmp-"))
            .collect();
        assert!(leftovers.is_empty(), "left behind: {:?}", leftovers);
    }

    #[test]
    fn remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.json");
        let store = JsonRecordStore::open(&path).unwrap();
        let a = record("a");
        let b = record("b");
        store.insert(a.clone()).unwrap();
        store.insert(b.clone()).unwrap();
        assert!(store.remove(a.id).unwrap());
        assert!(!store.remove(a.id).unwrap());
        let reopened = JsonRecordStore::open(&path).unwrap();
        let ids: Vec<_> = reopened.list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b.id]);
    }
}
