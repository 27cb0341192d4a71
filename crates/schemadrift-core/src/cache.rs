//! Schema cache - the last committed descriptor per provider.
//!
//! The cache is an injected repository with an explicit read/write contract.
//! Entries are stored as opaque bytes so that backups can capture and restore
//! them verbatim; [`SchemaCache::load`] and [`SchemaCache::store`] layer the
//! typed view on top.

use crate::descriptor::SchemaDescriptor;
use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};

/// A rename recorded for the data-loading collaborator.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct ColumnAlias {
    /// Name consumers may still ask for.
    pub from: String,
    /// Name the column carries now.
    pub to: String,
}

/// Declared default for a column added by a migration.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct ColumnDefault {
    /// Column name.
    pub column: String,
    /// Value used for rows that predate the column.
    pub value: String,
}

/// Persisted cache record for one provider.
#[derive(
    Debug, Clone, PartialEq, Archive, Serialize, Deserialize, serde::Serialize, serde::Deserialize,
)]
pub struct CacheEntry {
    /// Current committed descriptor.
    pub descriptor: SchemaDescriptor,
    /// Rename mapping consumed on the loader's next read.
    pub aliases: Vec<ColumnAlias>,
    /// Defaults for columns introduced by migrations.
    pub defaults: Vec<ColumnDefault>,
    /// Plan that produced this entry, if any.
    pub last_plan_id: Option<String>,
    /// Last write (microseconds since Unix epoch).
    pub updated_at: u64,
}

impl CacheEntry {
    /// Create an entry for a descriptor with no mapping.
    pub fn new(descriptor: SchemaDescriptor) -> Self {
        Self {
            descriptor,
            aliases: Vec::new(),
            defaults: Vec::new(),
            last_plan_id: None,
            updated_at: crate::current_timestamp(),
        }
    }

    /// Provider id.
    pub fn provider_id(&self) -> &str {
        &self.descriptor.provider_id
    }

    /// Fingerprint of the cached descriptor.
    pub fn fingerprint(&self) -> &str {
        &self.descriptor.fingerprint
    }

    /// Resolve a column name consumers ask for to the live column name.
    ///
    /// Follows rename aliases; returns `None` if the column no longer exists.
    pub fn resolve<'a>(&'a self, name: &'a str) -> Option<&'a str> {
        let mut current = name;
        // Each hop consumes one alias, so the walk is bounded.
        for _ in 0..=self.aliases.len() {
            if self.descriptor.column(current).is_some() {
                return Some(current);
            }
            match self.aliases.iter().find(|a| a.from == current) {
                Some(alias) => current = alias.to.as_str(),
                None => return None,
            }
        }
        None
    }

    /// Declared default for a column, if one was recorded.
    pub fn default_for(&self, column: &str) -> Option<&str> {
        self.defaults
            .iter()
            .find(|d| d.column == column)
            .map(|d| d.value.as_str())
    }

    /// Record a rename. Existing aliases pointing at `from` are redirected.
    pub fn add_alias(&mut self, from: &str, to: &str) {
        for alias in self.aliases.iter_mut().filter(|a| a.to == from) {
            alias.to = to.to_string();
        }
        self.aliases.retain(|a| a.from != from && a.from != a.to);
        self.aliases.push(ColumnAlias {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    /// Forget every alias and default that targets `column`.
    pub fn drop_mappings(&mut self, column: &str) {
        self.aliases.retain(|a| a.to != column);
        self.defaults.retain(|d| d.column != column);
    }

    /// Record a default for `column`, replacing any previous one.
    pub fn set_default(&mut self, column: &str, value: impl Into<String>) {
        self.defaults.retain(|d| d.column != column);
        self.defaults.push(ColumnDefault {
            column: column.to_string(),
            value: value.into(),
        });
    }

    /// Serialize the entry to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize an entry from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let aligned = crate::aligned(bytes);
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Repository of cached descriptors, one entry per provider.
pub trait SchemaCache: Send + Sync {
    /// Raw persisted bytes of a provider's entry.
    fn load_raw(&self, provider_id: &str) -> Result<Option<Vec<u8>>, Error>;

    /// Overwrite a provider's entry with raw bytes.
    fn store_raw(&self, provider_id: &str, bytes: &[u8]) -> Result<(), Error>;

    /// Remove a provider's entry.
    fn remove(&self, provider_id: &str) -> Result<(), Error>;

    /// Providers with an entry, in key order.
    fn providers(&self) -> Result<Vec<String>, Error>;

    /// Flush pending writes to durable storage.
    fn flush(&self) -> Result<(), Error>;

    /// Load and decode a provider's entry.
    fn load(&self, provider_id: &str) -> Result<Option<CacheEntry>, Error> {
        match self.load_raw(provider_id)? {
            Some(bytes) => Ok(Some(CacheEntry::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Encode and store an entry under its provider id.
    fn store(&self, entry: &CacheEntry) -> Result<(), Error> {
        let bytes = entry.to_bytes()?;
        self.store_raw(entry.provider_id(), &bytes)
    }
}

/// Sled-backed schema cache.
pub struct SledSchemaCache {
    tree: sled::Tree,
}

impl SledSchemaCache {
    /// Tree name for cached schemas.
    pub const TREE_NAME: &'static str = "schema:cache";

    /// Open or create the cache in `db`.
    pub fn open(db: &sled::Db) -> Result<Self, Error> {
        let tree = db.open_tree(Self::TREE_NAME)?;
        Ok(Self { tree })
    }
}

impl SchemaCache for SledSchemaCache {
    fn load_raw(&self, provider_id: &str) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.tree.get(provider_id.as_bytes())?.map(|v| v.to_vec()))
    }

    fn store_raw(&self, provider_id: &str, bytes: &[u8]) -> Result<(), Error> {
        self.tree.insert(provider_id.as_bytes(), bytes)?;
        Ok(())
    }

    fn remove(&self, provider_id: &str) -> Result<(), Error> {
        self.tree.remove(provider_id.as_bytes())?;
        Ok(())
    }

    fn providers(&self) -> Result<Vec<String>, Error> {
        let mut providers = Vec::new();
        for key in self.tree.iter().keys() {
            let key = key?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| Error::InvalidData(format!("provider key: {}", e)))?;
            providers.push(name);
        }
        Ok(providers)
    }

    fn flush(&self) -> Result<(), Error> {
        self.tree.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{ColumnDescriptor, ColumnType};

    fn entry() -> CacheEntry {
        CacheEntry::new(SchemaDescriptor::new(
            "finops",
            vec![
                ColumnDescriptor::new("app_id", ColumnType::String, 0).required(),
                ColumnDescriptor::new("monitoring_platform", ColumnType::String, 1),
            ],
        ))
    }

    #[test]
    fn test_resolve_follows_aliases() {
        let mut entry = entry();
        entry.add_alias("obs_platform", "monitoring_platform");

        assert_eq!(entry.resolve("app_id"), Some("app_id"));
        assert_eq!(entry.resolve("obs_platform"), Some("monitoring_platform"));
        assert_eq!(entry.resolve("missing"), None);
    }

    #[test]
    fn test_alias_chain_is_collapsed() {
        let mut entry = entry();
        entry.add_alias("platform", "obs_platform");
        entry.add_alias("obs_platform", "monitoring_platform");

        assert_eq!(entry.aliases.len(), 2);
        assert!(entry.aliases.iter().all(|a| a.to == "monitoring_platform"));
        assert_eq!(entry.resolve("platform"), Some("monitoring_platform"));
    }

    #[test]
    fn test_drop_mappings() {
        let mut entry = entry();
        entry.add_alias("obs_platform", "monitoring_platform");
        entry.set_default("monitoring_platform", "");
        entry.drop_mappings("monitoring_platform");

        assert!(entry.aliases.is_empty());
        assert!(entry.default_for("monitoring_platform").is_none());
    }

    #[test]
    fn test_entry_serialization() {
        let mut entry = entry();
        entry.set_default("region", "");
        let bytes = entry.to_bytes().unwrap();
        let restored = CacheEntry::from_bytes(&bytes).unwrap();
        assert_eq!(restored, entry);
    }

    #[test]
    fn test_sled_cache() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let cache = SledSchemaCache::open(&db).unwrap();

        assert!(cache.load("finops").unwrap().is_none());
        cache.store(&entry()).unwrap();

        let loaded = cache.load("finops").unwrap().unwrap();
        assert_eq!(loaded.descriptor.columns.len(), 2);
        assert_eq!(cache.providers().unwrap(), vec!["finops".to_string()]);

        let raw = cache.load_raw("finops").unwrap().unwrap();
        cache.remove("finops").unwrap();
        assert!(cache.load("finops").unwrap().is_none());

        cache.store_raw("finops", &raw).unwrap();
        assert_eq!(cache.load_raw("finops").unwrap().unwrap(), raw);
    }
}
