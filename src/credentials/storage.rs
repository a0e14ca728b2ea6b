//! File-backed credential storage.
//!
//! The record lives in a single JSON file. Every save writes a temporary
//! file, fsyncs it and renames it over the old one, so readers only ever see a
//! complete record.

use super::CredentialRecord;
use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Durable store for the singleton [`CredentialRecord`].
///
/// # Thread Safety
/// - All writes and read-modify-write cycles hold one in-process lock
/// - The rename makes each replace atomic for other processes
/// - A missing file is the logged-out state, not an error
pub struct CredentialStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl CredentialStore {
    /// Creates a store for the given file. Nothing is touched on disk until
    /// the first save.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the current record.
    ///
    /// # Returns
    /// * `Ok(Some(record))` - File present and parsed
    /// * `Ok(None)` - No file (logged out)
    /// * `Err` - Unreadable or corrupt file
    pub fn load(&self) -> Result<Option<CredentialRecord>> {
        let _guard = self.guard();
        self.read_unlocked()
    }

    /// Replaces the record wholesale.
    pub fn save(&self, record: &CredentialRecord) -> Result<()> {
        let _guard = self.guard();
        self.write_unlocked(record)
    }

    /// Applies `f` to the current record under the store lock.
    ///
    /// Writes and returns the new record when `f` returns `Some`. When no
    /// record exists, `f` is not called and nothing is written, so a late
    /// update can never resurrect credentials removed by logout.
    pub fn modify<F>(&self, f: F) -> Result<Option<CredentialRecord>>
    where
        F: FnOnce(&CredentialRecord) -> Option<CredentialRecord>,
    {
        let _guard = self.guard();
        let Some(current) = self.read_unlocked()? else {
            return Ok(None);
        };

        match f(&current) {
            Some(next) => {
                self.write_unlocked(&next)?;
                Ok(Some(next))
            }
            None => Ok(None),
        }
    }

    /// Removes the record.
    ///
    /// # Returns
    /// * `Ok(true)` - File deleted
    /// * `Ok(false)` - Nothing to delete
    pub fn delete(&self) -> Result<bool> {
        let _guard = self.guard();
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e).context("Failed to delete credentials file"),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        // Guards (), nothing to repair after a poison
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_unlocked(&self) -> Result<Option<CredentialRecord>> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to read credentials file {}", self.path.display())
                })
            }
        };

        let record = serde_json::from_str(&contents)
            .context("Failed to parse credentials file")?;
        Ok(Some(record))
    }

    fn write_unlocked(&self, record: &CredentialRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .context("Failed to create credentials directory")?;
            }
        }

        let json = serde_json::to_string_pretty(record)
            .context("Failed to serialize credentials")?;

        let tmp_path = self.tmp_path();
        {
            let mut file =
                File::create(&tmp_path).context("Failed to create temporary credentials file")?;
            restrict_permissions(&file)?;
            file.write_all(json.as_bytes())
                .context("Failed to write credentials")?;
            file.sync_all()
                .context("Failed to sync credentials file to disk")?;
        }

        fs::rename(&tmp_path, &self.path).context("Failed to replace credentials file")?;

        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}.tmp", std::process::id()));
        self.path.with_file_name(name)
    }
}

#[cfg(unix)]
fn restrict_permissions(file: &File) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(fs::Permissions::from_mode(0o600))
        .context("Failed to restrict credentials file permissions")
}

#[cfg(not(unix))]
fn restrict_permissions(_file: &File) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::SCHEMA_VERSION;
    use tempfile::TempDir;

    fn create_test_store(dir: &TempDir) -> CredentialStore {
        CredentialStore::new(dir.path().join("nested").join("credentials.json"))
    }

    fn create_test_record() -> CredentialRecord {
        CredentialRecord {
            access_token: Some("access-token-12345".to_string()),
            refresh_token: Some("refresh-token-67890".to_string()),
            expires_at: 4600,
            tenant_id: Some("cloud-9".to_string()),
            refresh_token_issued_at: Some(1000),
            last_refresh_at: Some(1000),
            last_refresh_error: None,
            schema_version: SCHEMA_VERSION,
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        let record = create_test_record();

        store.save(&record).expect("Failed to save");

        let loaded = store
            .load()
            .expect("Failed to load")
            .expect("Record not found");
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_load_missing_file_is_logged_out() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);

        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_load_corrupt_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("credentials.json");
        fs::write(&path, "{not json").unwrap();

        let store = CredentialStore::new(&path);
        assert!(store.load().is_err());
    }

    #[test]
    fn test_save_overwrites_wholesale() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        store.save(&create_test_record()).unwrap();

        let replacement = CredentialRecord {
            access_token: Some("other".to_string()),
            expires_at: 10,
            ..Default::default()
        };
        store.save(&replacement).unwrap();

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded, replacement);
        assert!(loaded.refresh_token.is_none());
        assert!(loaded.tenant_id.is_none());
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path().join("credentials.json"));
        store.save(&create_test_record()).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["credentials.json".to_string()]);
    }

    #[test]
    fn test_delete() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        store.save(&create_test_record()).unwrap();

        assert!(store.delete().unwrap());
        assert!(store.load().unwrap().is_none());

        // Deleting again should return false
        assert!(!store.delete().unwrap());
    }

    #[test]
    fn test_modify_writes_returned_record() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        store.save(&create_test_record()).unwrap();

        let updated = store
            .modify(|current| {
                let mut next = current.clone();
                next.access_token = Some("rotated".to_string());
                Some(next)
            })
            .unwrap();
        assert_eq!(updated.unwrap().access_token.as_deref(), Some("rotated"));

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.access_token.as_deref(), Some("rotated"));
    }

    #[test]
    fn test_modify_does_not_resurrect_deleted_record() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);

        let result = store
            .modify(|_| Some(create_test_record()))
            .unwrap();
        assert!(result.is_none());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_modify_can_decline() {
        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        let record = create_test_record();
        store.save(&record).unwrap();

        assert!(store.modify(|_| None).unwrap().is_none());
        assert_eq!(store.load().unwrap().unwrap(), record);
    }

    #[cfg(unix)]
    #[test]
    fn test_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = create_test_store(&dir);
        store.save(&create_test_record()).unwrap();

        let mode = fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
