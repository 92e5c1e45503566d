//! Persistent cache of parsed package manifests.
//!
//! Uses LMDB (via heed). Entries are keyed by the manifest's file path and
//! remember the modification time they were parsed at, so a rescan can reuse
//! them for files that did not change.

use anyhow::{Context, Result};
use heed::types::Str;
use heed::{Database, Env, EnvFlags, EnvOpenOptions};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::gatherer::PackageManifest;

pub const MANIFESTS_DB: &str = "manifests";

const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;
const DEFAULT_MAX_DBS: u32 = 4;

type StrDb = Database<Str, Str>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedManifest {
    pub mtime_nanos: u64,
    pub disk_size: i64,
    pub content_hash: String,
    pub manifest: PackageManifest,
}

#[derive(Debug, Clone)]
pub struct ScanCache {
    env: Arc<Env>,
    db_path: PathBuf,
    manifests: StrDb,
}

impl ScanCache {
    pub fn open(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create cache directory: {}", parent.display())
            })?;
        }

        let env = Arc::new(open_env(&db_path)?);
        let mut wtxn = env.write_txn()?;
        let manifests = env.create_database::<Str, Str>(&mut wtxn, Some(MANIFESTS_DB))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            db_path,
            manifests,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// The cached entry for `file`, if it was parsed at exactly `mtime_nanos`.
    pub fn get_fresh(&self, file: &Path, mtime_nanos: u64) -> Result<Option<CachedManifest>> {
        let key = file.to_string_lossy();
        let rtxn = self.env.read_txn()?;
        let Some(raw) = self.manifests.get(&rtxn, key.as_ref())? else {
            return Ok(None);
        };
        let Ok(entry) = serde_json::from_str::<CachedManifest>(raw) else {
            tracing::debug!(file = %key, "discarding unreadable scan cache entry");
            return Ok(None);
        };
        Ok((entry.mtime_nanos == mtime_nanos).then_some(entry))
    }

    pub fn put_many(&self, entries: &[(PathBuf, CachedManifest)]) -> Result<usize> {
        if entries.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self.env.write_txn()?;
        for (file, entry) in entries {
            let key = file.to_string_lossy();
            let value = serde_json::to_string(entry)?;
            self.manifests.put(&mut wtxn, key.as_ref(), value.as_str())?;
        }
        wtxn.commit()?;
        Ok(entries.len())
    }

    pub fn remove(&self, file: &Path) -> Result<bool> {
        let key = file.to_string_lossy();
        let mut wtxn = self.env.write_txn()?;
        let removed = self.manifests.delete(&mut wtxn, key.as_ref())?;
        wtxn.commit()?;
        Ok(removed)
    }

    pub fn len(&self) -> Result<u64> {
        let rtxn = self.env.read_txn()?;
        Ok(self.manifests.len(&rtxn)?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

pub fn mtime_nanos(path: &Path) -> u64 {
    let mtime = path
        .metadata()
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let nanos = mtime
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    u64::try_from(nanos).unwrap_or(u64::MAX)
}

fn open_env(db_path: &Path) -> Result<Env> {
    let mut options = EnvOpenOptions::new();
    options.map_size(DEFAULT_MAP_SIZE);
    options.max_dbs(DEFAULT_MAX_DBS);
    // SAFETY: We do not use NO_LOCK and keep default LMDB locking guarantees.
    // NO_SUB_DIR keeps the cache a single file next to the catalog.
    unsafe {
        options.flags(EnvFlags::NO_SUB_DIR);
        options
            .open(db_path)
            .with_context(|| format!("Failed to create/open scan cache: {}", db_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db_path(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!(
            "asset_catalog_test_{}_{}_{}.lmdb",
            std::process::id(),
            nanos,
            name
        ))
    }

    #[test]
    fn entries_are_reused_only_for_matching_mtime() -> Result<()> {
        let cache = ScanCache::open(temp_db_path("mtime"))?;
        let file = PathBuf::from("/content/Props/Chair.pkg.json");
        let entry = CachedManifest {
            mtime_nanos: 42,
            disk_size: 10,
            content_hash: "00".repeat(32),
            manifest: PackageManifest::default(),
        };
        assert_eq!(cache.put_many(&[(file.clone(), entry.clone())])?, 1);

        assert_eq!(cache.get_fresh(&file, 42)?, Some(entry));
        assert_eq!(cache.get_fresh(&file, 43)?, None);
        assert_eq!(cache.len()?, 1);

        assert!(cache.remove(&file)?);
        assert!(cache.is_empty()?);
        let _ = std::fs::remove_file(cache.path());
        Ok(())
    }
}
