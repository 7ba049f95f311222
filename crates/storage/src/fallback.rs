//! Durable slot that lives outside the primary engine, so it survives a
//! destroyed or unreadable database.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use snafu::ResultExt;

use super::error::{SlotIoSnafu, StorageResult};

pub const BACKUP_SLOT_KEY: &str = "conversations-backup";
pub const RECOVERY_ATTEMPTS_SLOT_KEY: &str = "recovery-attempts";

pub trait SnapshotSlot: Send + Sync + 'static {
    fn read(&self, key: &str) -> StorageResult<Option<String>>;
    fn write(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
}

/// One file per key inside `dir`, replaced atomically on every write.
#[derive(Debug, Clone)]
pub struct FileSlot {
    dir: PathBuf,
}

impl FileSlot {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl SnapshotSlot for FileSlot {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        let path = self.path_for(key);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(source).context(SlotIoSnafu {
                stage: "file-slot-read",
                path: path.display().to_string(),
            }),
        }
    }

    fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        std::fs::create_dir_all(&self.dir).context(SlotIoSnafu {
            stage: "file-slot-create-directory",
            path: self.dir.display().to_string(),
        })?;

        let path = self.path_for(key);
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, value).context(SlotIoSnafu {
            stage: "file-slot-write-temporary",
            path: temp_path.display().to_string(),
        })?;
        std::fs::rename(&temp_path, &path).context(SlotIoSnafu {
            stage: "file-slot-rename-temporary",
            path: path.display().to_string(),
        })?;

        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(source).context(SlotIoSnafu {
                stage: "file-slot-remove",
                path: path.display().to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemorySlot {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySlot {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotSlot for MemorySlot {
    fn read(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self
            .values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned())
    }

    fn write(&self, key: &str, value: &str) -> StorageResult<()> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.values
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_slot_round_trips_and_tolerates_missing_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let slot = FileSlot::new(dir.path().join("fallback"));

        assert_eq!(slot.read(BACKUP_SLOT_KEY).expect("read"), None);
        slot.write(BACKUP_SLOT_KEY, "[]").expect("write");
        assert_eq!(slot.read(BACKUP_SLOT_KEY).expect("read"), Some("[]".to_string()));

        slot.remove(BACKUP_SLOT_KEY).expect("remove");
        slot.remove(BACKUP_SLOT_KEY).expect("remove twice");
        assert_eq!(slot.read(BACKUP_SLOT_KEY).expect("read"), None);
    }
}
