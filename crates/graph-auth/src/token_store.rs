//! Persistent token cache
//!
//! One JSON file maps identities to token records. Every access re-reads the
//! file, so edits by another process are picked up; a missing or corrupt file
//! reads as empty. All writes are whole-file replacements via atomic
//! temp-file + rename with 0600 permissions. A tokio Mutex serializes
//! mutations within the process; cross-process writers are last-write-wins.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use common::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One identity's cached tokens.
///
/// `expires_at` is a unix timestamp in milliseconds (absolute), computed at
/// storage time from the provider's `expires_in` seconds delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    pub expires_at: u64,
    #[serde(default)]
    pub scope: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
}

fn default_token_type() -> String {
    "Bearer".into()
}

impl TokenRecord {
    /// Whether the access token expires within `skew_millis` from now.
    pub fn expires_within(&self, skew_millis: u64) -> bool {
        self.expires_at <= now_millis().saturating_add(skew_millis)
    }
}

/// Current time as unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Token cache file manager. The path's parent directory is created on the
/// first write.
pub struct TokenStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TokenStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Fail if the cache file exists but cannot be read. A parse failure is
    /// not an error here; corrupt caches read as empty everywhere.
    pub async fn ensure_readable(&self) -> Result<()> {
        if self.path.exists() {
            tokio::fs::read(&self.path).await?;
        }
        Ok(())
    }

    pub async fn get(&self, user_id: &str) -> Option<TokenRecord> {
        self.read_all().await.get(user_id).cloned()
    }

    pub async fn list_identities(&self) -> Vec<String> {
        self.read_all().await.keys().cloned().collect()
    }

    /// Add or replace a record and persist.
    pub async fn put(&self, user_id: &str, record: TokenRecord) -> Result<()> {
        if record.access_token.trim().is_empty() {
            return Err(Error::TokenExchange(
                "refusing to cache a record with an empty access_token".into(),
            ));
        }
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await;
        all.insert(user_id.to_string(), record);
        self.write_atomic(&all).await?;
        debug!(user_id, "cached token record");
        Ok(())
    }

    /// Remove one identity. Returns whether it existed.
    pub async fn delete(&self, user_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut all = self.read_all().await;
        if all.remove(user_id).is_none() {
            return Ok(false);
        }
        self.write_atomic(&all).await?;
        debug!(user_id, "removed token record");
        Ok(true)
    }

    /// Remove every identity. Returns whether anything was removed.
    pub async fn clear(&self) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let all = self.read_all().await;
        if all.is_empty() {
            return Ok(false);
        }
        self.write_atomic(&HashMap::new()).await?;
        debug!(removed = all.len(), "cleared token cache");
        Ok(true)
    }

    async fn read_all(&self) -> HashMap<String, TokenRecord> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HashMap::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read token cache, treating as empty");
                return HashMap::new();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(all) => all,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "token cache is corrupt, treating as empty");
                HashMap::new()
            }
        }
    }

    /// Whole-file replacement: temp file in the same directory, 0600 perms,
    /// then rename over the target.
    async fn write_atomic(&self, all: &HashMap<String, TokenRecord>) -> Result<()> {
        let json = serde_json::to_string_pretty(all)
            .map_err(|e| Error::CacheSerialize(format!("serializing token cache: {e}")))?;

        let dir = self.path.parent().ok_or_else(|| {
            Error::Config(format!(
                "token_cache_path {} has no parent directory",
                self.path.display()
            ))
        })?;
        tokio::fs::create_dir_all(dir).await?;

        let tmp_path = dir.join(format!(".tokens.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp_path, json.as_bytes()).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp_path, perms).await?;
        }

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}
