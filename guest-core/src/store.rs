//! Persistent key store
//!
//! Multi-valued string entries addressed by (section, name), used by the
//! reconcilers to remember what they last applied (forwarded IPs per
//! MAC, the published windows-key list). Backed by one JSON file per
//! section under the agent state directory, written atomically so a
//! crash never leaves a half-written section behind.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// State directory for everything the agent owns.
#[cfg(windows)]
pub const DEFAULT_STATE_DIR: &str = r"C:\ProgramData\GuestAgent";
#[cfg(not(windows))]
pub const DEFAULT_STATE_DIR: &str = "/var/lib/guest-agent";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The entry (or its whole section) has never been written.
    #[error("no stored entry for {section}/{name}")]
    NotExist { section: String, name: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

type Section = BTreeMap<String, Vec<String>>;

/// File-backed store. Each manager touches its own sections only, so no
/// cross-manager locking is needed.
#[derive(Debug, Clone)]
pub struct KeyStore {
    root: PathBuf,
}

impl KeyStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn open_default() -> Self {
        Self::new(DEFAULT_STATE_DIR)
    }

    fn section_path(&self, section: &str) -> PathBuf {
        self.root.join(format!("{section}.json"))
    }

    fn load_section(&self, path: &Path) -> Result<Option<Section>, StoreError> {
        match std::fs::read(path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Reads the values stored under (section, name).
    /// [`StoreError::NotExist`] is the "never written" case callers are
    /// expected to treat as an empty baseline.
    pub fn read(&self, section: &str, name: &str) -> Result<Vec<String>, StoreError> {
        let not_exist = || StoreError::NotExist {
            section: section.to_string(),
            name: name.to_string(),
        };
        let map = self
            .load_section(&self.section_path(section))?
            .ok_or_else(not_exist)?;
        map.get(name).cloned().ok_or_else(not_exist)
    }

    /// Replaces the values stored under (section, name), creating the
    /// section file if needed. The section is rewritten through a temp
    /// file and renamed into place.
    pub fn write(&self, section: &str, name: &str, values: &[String]) -> Result<(), StoreError> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.section_path(section);
        let mut map = match self.load_section(&path) {
            Ok(Some(map)) => map,
            Ok(None) => Section::new(),
            Err(err) => {
                // A corrupt section file only holds this section's own
                // entries; start it over rather than wedging the manager.
                tracing::warn!("resetting corrupt store section {section}: {err}");
                Section::new()
            }
        };
        map.insert(name.to_string(), values.to_vec());

        let mut tmp = tempfile::NamedTempFile::new_in(&self.root)?;
        tmp.write_all(&serde_json::to_vec_pretty(&map)?)?;
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_missing_is_not_exist() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        assert!(matches!(
            store.read("forwarded-ips", "42:01:0a:00:00:02"),
            Err(StoreError::NotExist { .. })
        ));
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        let values = vec!["10.0.0.5".to_string(), "10.0.0.6".to_string()];
        store.write("forwarded-ips", "42:01:0a:00:00:02", &values).unwrap();
        assert_eq!(store.read("forwarded-ips", "42:01:0a:00:00:02").unwrap(), values);

        // Overwrite replaces, not appends.
        store.write("forwarded-ips", "42:01:0a:00:00:02", &[]).unwrap();
        assert!(store.read("forwarded-ips", "42:01:0a:00:00:02").unwrap().is_empty());
    }

    #[test]
    fn test_entries_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = KeyStore::new(dir.path());
        store.write("forwarded-ips", "mac-a", &["1.1.1.1".to_string()]).unwrap();
        store.write("forwarded-ips", "mac-b", &["2.2.2.2".to_string()]).unwrap();
        store.write("accounts", "public-keys", &["{}".to_string()]).unwrap();

        assert_eq!(store.read("forwarded-ips", "mac-a").unwrap(), ["1.1.1.1"]);
        assert_eq!(store.read("forwarded-ips", "mac-b").unwrap(), ["2.2.2.2"]);
        assert_eq!(store.read("accounts", "public-keys").unwrap(), ["{}"]);
    }
}
