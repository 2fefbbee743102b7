//! Persistent key material, one record per (participant, target)

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use dashmap::DashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::{Error, GroupKeyMaterial, Result};

/// Storage for a participant's [`GroupKeyMaterial`]
pub trait KeyStore: Send + Sync {
    /// Load the material for `target`, if any
    fn get(&self, participant_id: &str, target: &str) -> Result<Option<GroupKeyMaterial>>;

    /// Store (or replace) the material for its target
    fn put(&self, material: &GroupKeyMaterial) -> Result<()>;
}

/// In-memory store for tests and ephemeral devices
#[derive(Clone, Default)]
pub struct MemoryKeyStore {
    records: Arc<DashMap<(String, String), GroupKeyMaterial>>,
}

impl MemoryKeyStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyStore for MemoryKeyStore {
    fn get(&self, participant_id: &str, target: &str) -> Result<Option<GroupKeyMaterial>> {
        Ok(self
            .records
            .get(&(participant_id.to_string(), target.to_string()))
            .map(|entry| entry.value().clone()))
    }

    fn put(&self, material: &GroupKeyMaterial) -> Result<()> {
        self.records.insert(
            (material.participant_id.clone(), material.target.clone()),
            material.clone(),
        );
        Ok(())
    }
}

/// Pretty JSON file per record under a directory
///
/// File names are `<participant>.<target>.json` with both components
/// base64url-encoded, so distinct pairs never share a file.
#[derive(Debug, Clone)]
pub struct FileKeyStore {
    dir: PathBuf,
}

impl FileKeyStore {
    /// Use `dir`, creating it if needed
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    fn path(&self, participant_id: &str, target: &str) -> PathBuf {
        self.dir.join(file_name(participant_id, target))
    }
}

fn file_name(participant_id: &str, target: &str) -> String {
    format!(
        "{}.{}.json",
        URL_SAFE_NO_PAD.encode(participant_id),
        URL_SAFE_NO_PAD.encode(target)
    )
}

impl KeyStore for FileKeyStore {
    fn get(&self, participant_id: &str, target: &str) -> Result<Option<GroupKeyMaterial>> {
        let path = self.path(participant_id, target);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(&path)?;
        let material: GroupKeyMaterial =
            serde_json::from_str(&json).map_err(|e| Error::Deserialization(e.to_string()))?;
        if material.participant_id != participant_id || material.target != target {
            return Err(Error::Storage(format!(
                "{} holds material of {} for {}",
                path.display(),
                material.participant_id,
                material.target
            )));
        }
        Ok(Some(material))
    }

    /// Written to a temporary file, synced, then renamed over the record
    fn put(&self, material: &GroupKeyMaterial) -> Result<()> {
        let path = self.path(&material.participant_id, &material.target);
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        let json = serde_json::to_string_pretty(material)?;

        let written = (|| -> std::io::Result<()> {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            std::fs::rename(&tmp, &path)
        })();
        if let Err(e) = written {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }

        debug!(path = %path.display(), "Key material written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Point;
    use chrono::Utc;
    use k256::{ProjectivePoint, Scalar};
    use std::collections::BTreeMap;

    fn material(target: &str) -> GroupKeyMaterial {
        material_for("device_1", target)
    }

    fn material_for(participant_id: &str, target: &str) -> GroupKeyMaterial {
        GroupKeyMaterial {
            participant_id: participant_id.into(),
            target: target.into(),
            ceremony_id: uuid::Uuid::new_v4(),
            share_index: 1,
            threshold: 2,
            participants: BTreeMap::new(),
            secret_coefficient: Scalar::from(5u64),
            secret_share: Scalar::from(11u64),
            group_public_key: Point(ProjectivePoint::GENERATOR),
            public_shares: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    fn check_store(store: &dyn KeyStore) {
        assert!(store.get("device_1", "treasury").unwrap().is_none());
        store.put(&material("treasury")).unwrap();

        let loaded = store.get("device_1", "treasury").unwrap().unwrap();
        assert_eq!(loaded.secret_share, Scalar::from(11u64));
        assert_eq!(loaded.secret_coefficient, Scalar::from(5u64));
        assert!(store.get("device_2", "treasury").unwrap().is_none());
        assert!(store.get("device_1", "payroll").unwrap().is_none());
    }

    #[test]
    fn test_memory_store() {
        check_store(&MemoryKeyStore::new());
    }

    #[test]
    fn test_file_store() {
        let dir = std::env::temp_dir().join(format!("tecdsa-store-{}", uuid::Uuid::new_v4()));
        let store = FileKeyStore::open(&dir).unwrap();
        check_store(&store);

        // Survives reopening
        let reopened = FileKeyStore::open(&dir).unwrap();
        assert!(reopened.get("device_1", "treasury").unwrap().is_some());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_store_keeps_lookalike_ids_apart() {
        let dir = std::env::temp_dir().join(format!("tecdsa-store-{}", uuid::Uuid::new_v4()));
        let store = FileKeyStore::open(&dir).unwrap();

        let mut first = material_for("device_1", "x");
        first.secret_coefficient = Scalar::from(1u64);
        let mut second = material_for("device", "1_x");
        second.secret_coefficient = Scalar::from(2u64);
        let mut slash = material_for("device_1", "a/b");
        slash.secret_coefficient = Scalar::from(3u64);
        let mut underscore = material_for("device_1", "a_b");
        underscore.secret_coefficient = Scalar::from(4u64);
        for m in [&first, &second, &slash, &underscore] {
            store.put(m).unwrap();
        }

        let coefficient = |p: &str, t: &str| store.get(p, t).unwrap().unwrap().secret_coefficient;
        assert_eq!(coefficient("device_1", "x"), Scalar::from(1u64));
        assert_eq!(coefficient("device", "1_x"), Scalar::from(2u64));
        assert_eq!(coefficient("device_1", "a/b"), Scalar::from(3u64));
        assert_eq!(coefficient("device_1", "a_b"), Scalar::from(4u64));

        // Only the four records remain; no temporary files linger
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 4);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_file_store_rejects_misplaced_record() {
        let dir = std::env::temp_dir().join(format!("tecdsa-store-{}", uuid::Uuid::new_v4()));
        let store = FileKeyStore::open(&dir).unwrap();
        store.put(&material("treasury")).unwrap();

        std::fs::rename(
            store.path("device_1", "treasury"),
            store.path("device_1", "payroll"),
        )
        .unwrap();
        assert!(matches!(
            store.get("device_1", "payroll"),
            Err(Error::Storage(_))
        ));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
