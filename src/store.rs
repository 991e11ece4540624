//! Session store adapters
//!
//! Optional storage for encrypted refresh tokens, keyed by a fingerprint of
//! the access token. The cookie-backed path is the source of truth for
//! correctness; a store is an optimization, and store failures are logged
//! but never fail the request.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Error, Result};

/// Derive the store key for an encoded access token
#[must_use]
pub fn token_fingerprint(encoded_token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(encoded_token.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Keyed storage for encrypted refresh-token blobs
///
/// Writes are last-writer-wins; concurrent refreshes for the same identity
/// are tolerated because each writes under the latest fingerprint.
#[async_trait]
pub trait RefreshStore: Send + Sync {
    /// Store a blob under the fingerprint with a time-to-live
    async fn put(&self, fingerprint: &str, blob: &str, ttl: Duration) -> Result<()>;
    /// Fetch the blob for a fingerprint, `None` when absent or expired
    async fn get(&self, fingerprint: &str) -> Result<Option<String>>;
    /// Remove the blob for a fingerprint
    async fn delete(&self, fingerprint: &str) -> Result<()>;
}

/// Build a store from its URL; `None` when the URL is empty (cookie-only)
pub fn from_url(url: &str) -> Result<Option<Arc<dyn RefreshStore>>> {
    if url.is_empty() {
        return Ok(None);
    }
    if url == "memory://" {
        return Ok(Some(Arc::new(MemoryStore::new())));
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Some(Arc::new(DiskStore::new(PathBuf::from(path))?)));
    }
    Err(Error::Config(format!("unsupported store_url: {url}")))
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// In-process store, useful for single-instance deployments and tests
pub struct MemoryStore {
    entries: DashMap<String, (String, u64)>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RefreshStore for MemoryStore {
    async fn put(&self, fingerprint: &str, blob: &str, ttl: Duration) -> Result<()> {
        let deadline = unix_now() + ttl.as_secs();
        self.entries
            .insert(fingerprint.to_string(), (blob.to_string(), deadline));
        Ok(())
    }

    async fn get(&self, fingerprint: &str) -> Result<Option<String>> {
        // Clone out of the shard guard before any mutation
        let entry = self.entries.get(fingerprint).map(|e| e.clone());
        match entry {
            Some((blob, deadline)) if deadline > unix_now() => Ok(Some(blob)),
            Some(_) => {
                self.entries.remove(fingerprint);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, fingerprint: &str) -> Result<()> {
        self.entries.remove(fingerprint);
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct DiskRecord {
    blob: String,
    expires_at: u64,
}

/// One-file-per-record store surviving proxy restarts
pub struct DiskStore {
    base_dir: PathBuf,
}

impl DiskStore {
    /// Create the store, making the base directory if needed
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        if !base_dir.exists() {
            fs::create_dir_all(&base_dir)
                .map_err(|e| Error::StoreUnavailable(format!("creating store dir: {e}")))?;
        }
        Ok(Self { base_dir })
    }

    fn record_path(&self, fingerprint: &str) -> PathBuf {
        // Fingerprints are hex sha256, safe as file names
        self.base_dir.join(format!("{fingerprint}.json"))
    }
}

#[async_trait]
impl RefreshStore for DiskStore {
    async fn put(&self, fingerprint: &str, blob: &str, ttl: Duration) -> Result<()> {
        let record = DiskRecord {
            blob: blob.to_string(),
            expires_at: unix_now() + ttl.as_secs(),
        };
        let path = self.record_path(fingerprint);
        let content = serde_json::to_string(&record)?;

        fs::write(&path, content).map_err(|e| Error::StoreUnavailable(e.to_string()))?;

        // Restrictive permissions (owner read/write only)
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = fs::Permissions::from_mode(0o600);
            let _ = fs::set_permissions(&path, perms);
        }

        Ok(())
    }

    async fn get(&self, fingerprint: &str) -> Result<Option<String>> {
        let path = self.record_path(fingerprint);
        if !path.exists() {
            return Ok(None);
        }

        let content =
            fs::read_to_string(&path).map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        let record: DiskRecord = serde_json::from_str(&content)?;

        if record.expires_at <= unix_now() {
            debug!(fingerprint = %fingerprint, "stored refresh record expired");
            let _ = fs::remove_file(&path);
            return Ok(None);
        }

        Ok(Some(record.blob))
    }

    async fn delete(&self, fingerprint: &str) -> Result<()> {
        let path = self.record_path(fingerprint);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::StoreUnavailable(e.to_string()))?;
        }
        Ok(())
    }
}
