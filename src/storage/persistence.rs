//! Durable dump and reload of the object store.

use super::memory::StoreImage;
use crate::core::{DbError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

const DUMP_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct DumpFile {
    pub version: u32,
    pub metadata: DumpMetadata,
    pub image: StoreImage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpMetadata {
    pub created_at: DateTime<Utc>,
    pub object_count: usize,
    pub base_count: usize,
}

/// Writes store images to a single dump file, atomically.
///
/// A dump either lands completely or leaves the previous file untouched:
/// the image is written to a temp file in the same directory and renamed
/// over the target. With archiving on, the previous dump is first copied
/// aside under a timestamped name.
#[derive(Debug, Clone)]
pub struct DumpManager {
    path: PathBuf,
    archive: bool,
}

impl DumpManager {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            archive: false,
        }
    }

    pub fn with_archive(mut self, archive: bool) -> Self {
        self.archive = archive;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn dump(&self, image: StoreImage) -> Result<DumpMetadata> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)
            .map_err(|e| DbError::IoError(format!("Failed to create dump directory: {}", e)))?;

        if self.archive && self.path.exists() {
            let archived = self.archive_path(Utc::now());
            fs::copy(&self.path, &archived)
                .map_err(|e| DbError::IoError(format!("Failed to archive previous dump: {}", e)))?;
            debug!(archive = %archived.display(), "archived previous dump");
        }

        let metadata = DumpMetadata {
            created_at: Utc::now(),
            object_count: image.objects.len(),
            base_count: image.catalog.base_ids().len(),
        };
        let file = DumpFile {
            version: DUMP_VERSION,
            metadata: metadata.clone(),
            image,
        };
        let serialized = rmp_serde::to_vec(&file)
            .map_err(|e| DbError::SerializationError(format!("Failed to serialize dump: {}", e)))?;

        let mut temp = NamedTempFile::new_in(&dir)
            .map_err(|e| DbError::IoError(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&serialized)
            .map_err(|e| DbError::IoError(format!("Failed to write dump: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| DbError::IoError(format!("Failed to sync dump: {}", e)))?;
        temp.persist(&self.path)
            .map_err(|e| DbError::IoError(format!("Failed to rename dump: {}", e.error)))?;

        info!(
            path = %self.path.display(),
            objects = metadata.object_count,
            "database dumped"
        );
        Ok(metadata)
    }

    pub fn load(&self) -> Result<Option<StoreImage>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.path)
            .map_err(|e| DbError::IoError(format!("Failed to read dump: {}", e)))?;
        let file: DumpFile = rmp_serde::from_slice(&data)
            .map_err(|e| DbError::SerializationError(format!("Failed to deserialize dump: {}", e)))?;
        if file.version != DUMP_VERSION {
            return Err(DbError::SerializationError(format!(
                "Unsupported dump version {}",
                file.version
            )));
        }
        info!(
            path = %self.path.display(),
            objects = file.metadata.object_count,
            dumped_at = %file.metadata.created_at,
            "database loaded"
        );
        Ok(Some(file.image))
    }

    fn archive_path(&self, at: DateTime<Utc>) -> PathBuf {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "wardendb.db".to_string());
        self.path
            .with_file_name(format!("{}.{}", name, at.format("%Y%m%d-%H%M%S%.3f")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::DbObject;
    use crate::storage::catalog::{Catalog, USER_BASE, user_fields};
    use crate::storage::memory::ObjectStore;
    use tempfile::TempDir;

    fn populated() -> ObjectStore {
        let store = ObjectStore::new(Catalog::with_builtins());
        let mut alice = DbObject::new(store.reserve_invid(USER_BASE).unwrap());
        alice.set(user_fields::USERNAME, "alice".into());
        store.apply(vec![(alice.invid(), Some(alice))], Utc::now()).unwrap();
        store
    }

    #[test]
    fn test_dump_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let manager = DumpManager::new(temp_dir.path().join("wardendb.db"));
        assert!(manager.load().unwrap().is_none());

        let meta = manager.dump(populated().image().unwrap()).unwrap();
        assert_eq!(meta.object_count, 1);
        assert!(manager.exists());

        let image = manager.load().unwrap().unwrap();
        let store = ObjectStore::from_image(image);
        assert_eq!(store.find_by_label(USER_BASE, "ALICE").unwrap().len(), 1);
    }

    #[test]
    fn test_archive_keeps_previous() {
        let temp_dir = TempDir::new().unwrap();
        let manager = DumpManager::new(temp_dir.path().join("wardendb.db")).with_archive(true);
        manager.dump(populated().image().unwrap()).unwrap();
        manager.dump(populated().image().unwrap()).unwrap();

        let files = fs::read_dir(temp_dir.path()).unwrap().count();
        assert_eq!(files, 2);
    }

    #[test]
    fn test_unwritable_target_is_io_error() {
        let temp_dir = TempDir::new().unwrap();
        // the target path is an existing directory, so the final rename fails
        let target = temp_dir.path().join("taken");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("child"), b"x").unwrap();
        let err = DumpManager::new(&target).dump(populated().image().unwrap()).unwrap_err();
        assert!(matches!(err, DbError::IoError(_)));
    }
}
