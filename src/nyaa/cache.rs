use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use super::RawListing;
use crate::error::{Error, Result};
use crate::library::parser::normalize_alias;

/// Cache key for a free-text query
pub fn normalize_query(query: &str) -> String {
    normalize_alias(query)
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    query: String,
    fetched_at: DateTime<Utc>,
    listing: RawListing,
}

/// On-disk listing cache, one JSON file per normalized query.
///
/// Entries are never modified in place: a refresh writes a new file and
/// renames it over the old one.
#[derive(Debug, Clone)]
pub struct ListingCache {
    dir: PathBuf,
    timeout: Duration,
}

impl ListingCache {
    pub fn new(dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            dir: dir.into(),
            timeout,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key);
        self.dir.join(format!("{:x}.json", hasher.finalize()))
    }

    fn read_entry(&self, path: &Path) -> Result<CacheEntry> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Fresh entry for `key`, if any
    pub fn get(&self, key: &str) -> Option<RawListing> {
        let path = self.entry_path(key);
        if !path.exists() {
            return None;
        }

        let entry = match self.read_entry(&path) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Ignoring unreadable cache entry");
                return None;
            }
        };

        // A collision or a stale key layout is just a miss
        if entry.query != key {
            return None;
        }

        let age = Utc::now().signed_duration_since(entry.fetched_at);
        let fresh = age
            .to_std()
            .map(|age| age < self.timeout)
            .unwrap_or(false);
        if !fresh {
            debug!(query = %key, "Listing cache entry expired");
            return None;
        }
        Some(entry.listing)
    }

    pub fn put(&self, key: &str, listing: &RawListing) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let entry = CacheEntry {
            query: key.to_string(),
            fetched_at: Utc::now(),
            listing: listing.clone(),
        };
        let content = serde_json::to_vec(&entry)?;

        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&content)?;
        tmp.persist(self.entry_path(key))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }
}
