//! Pre-migration backups.
//!
//! A backup holds the exact persisted bytes of a provider's cache entry so a
//! failed migration can restore it verbatim, plus an optional compressed
//! snapshot of the provider's raw source data.

use super::error::MigrationError;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rkyv::{Archive, Deserialize, Serialize};
use std::io::{Read, Write};

/// A persisted backup.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct Backup {
    /// Timestamp-derived reference.
    pub backup_ref: String,
    /// Provider the backup belongs to.
    pub provider_id: String,
    /// Plan being executed when the backup was taken.
    pub plan_id: String,
    /// Creation time (microseconds since Unix epoch).
    pub created_at: u64,
    /// Exact cache bytes, `None` if the provider had no entry.
    pub cache_bytes: Option<Vec<u8>>,
    /// Gzip-compressed source data.
    pub source_snapshot: Option<Vec<u8>>,
}

impl Backup {
    /// Create a backup taken now.
    pub fn new(
        provider_id: &str,
        plan_id: &str,
        cache_bytes: Option<Vec<u8>>,
        source_snapshot: Option<Vec<u8>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            backup_ref: backup_ref(provider_id, plan_id, now),
            provider_id: provider_id.to_string(),
            plan_id: plan_id.to_string(),
            created_at: now.timestamp_micros().max(0) as u64,
            cache_bytes,
            source_snapshot,
        }
    }

    /// Decompress the source snapshot.
    pub fn source_data(&self) -> Result<Option<Vec<u8>>, MigrationError> {
        self.source_snapshot.as_deref().map(decompress).transpose()
    }

    /// Serialize the backup to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, MigrationError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| MigrationError::Serialization(e.to_string()))
    }

    /// Deserialize a backup from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, MigrationError> {
        let aligned = crate::aligned(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| MigrationError::Deserialization(e.to_string()))
    }
}

/// Reference of the form `{provider}_{YYYYmmdd_HHMMSS_ffffff}_{plan8}`.
pub fn backup_ref(provider_id: &str, plan_id: &str, at: DateTime<Utc>) -> String {
    let plan_prefix: String = plan_id.chars().take(8).collect();
    format!(
        "{}_{}_{}",
        provider_id,
        at.format("%Y%m%d_%H%M%S_%6f"),
        plan_prefix
    )
}

/// Gzip-compress raw bytes.
pub fn compress(data: &[u8]) -> Result<Vec<u8>, MigrationError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| MigrationError::Serialization(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| MigrationError::Serialization(e.to_string()))
}

/// Decompress gzip bytes.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>, MigrationError> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|e| MigrationError::Deserialization(e.to_string()))?;
    Ok(out)
}

/// Storage for backups.
pub trait BackupStore: Send + Sync {
    /// Persist a backup. An error means the backup does not exist.
    fn save(&self, backup: &Backup) -> Result<(), MigrationError>;

    /// Load a backup by reference.
    fn load(&self, backup_ref: &str) -> Result<Option<Backup>, MigrationError>;

    /// Backups for a provider, oldest first.
    fn list_for_provider(&self, provider_id: &str) -> Result<Vec<Backup>, MigrationError>;
}

/// Sled-backed backup store.
pub struct SledBackupStore {
    tree: sled::Tree,
}

impl SledBackupStore {
    /// Tree name for backups.
    pub const TREE_NAME: &'static str = "migration:backups";

    /// Open or create the backup store.
    pub fn open(db: &sled::Db) -> Result<Self, MigrationError> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }
}

impl BackupStore for SledBackupStore {
    fn save(&self, backup: &Backup) -> Result<(), MigrationError> {
        self.tree
            .insert(backup.backup_ref.as_bytes(), backup.to_bytes()?)?;
        self.tree.flush()?;
        Ok(())
    }

    fn load(&self, backup_ref: &str) -> Result<Option<Backup>, MigrationError> {
        match self.tree.get(backup_ref.as_bytes())? {
            Some(bytes) => Ok(Some(Backup::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    fn list_for_provider(&self, provider_id: &str) -> Result<Vec<Backup>, MigrationError> {
        let prefix = format!("{}_", provider_id);
        let mut backups = Vec::new();
        for result in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, value) = result?;
            let backup = Backup::from_bytes(&value)?;
            if backup.provider_id == provider_id {
                backups.push(backup);
            }
        }
        backups.sort_by_key(|b| b.created_at);
        Ok(backups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_backup_ref_format() {
        let at = Utc.with_ymd_and_hms(2025, 1, 15, 10, 30, 5).unwrap();
        let r = backup_ref("finops", "0123456789abcdef", at);
        assert_eq!(r, "finops_20250115_103005_000000_01234567");
    }

    #[test]
    fn test_compression() {
        let data = b"app_id,cost\nApp1,10\nApp2,12.5\n".repeat(20);
        let packed = compress(&data).unwrap();
        assert!(packed.len() < data.len());
        assert_eq!(decompress(&packed).unwrap(), data);
    }

    #[test]
    fn test_sled_backup_store() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = SledBackupStore::open(&db).unwrap();

        let snapshot = compress(b"app_id\nApp1\n").unwrap();
        let backup = Backup::new("finops", "abcdef0123", Some(vec![1, 2, 3]), Some(snapshot));
        store.save(&backup).unwrap();
        store
            .save(&Backup::new("finops_eu", "abcdef0123", None, None))
            .unwrap();

        let loaded = store.load(&backup.backup_ref).unwrap().unwrap();
        assert_eq!(loaded, backup);
        assert_eq!(loaded.source_data().unwrap().unwrap(), b"app_id\nApp1\n");

        let listed = store.list_for_provider("finops").unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.load("missing").unwrap().is_none());
    }
}
