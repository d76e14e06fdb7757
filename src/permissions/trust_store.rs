//! Persisted "always allow" decisions, keyed by app identifier.
//!
//! The whole file is read on every access and rewritten on every mutation.
//! Writes go through a unique temp file plus rename so a reader never sees a
//! half-written store. Concurrent writers are not coordinated: last one wins.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::app_id::AppId;
use crate::paths::{Paths, create_dir_with_mode};
use crate::sandbox::policy::SandboxPolicy;

/// The only choice that is ever persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoredChoice {
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRecord {
    /// Unix epoch milliseconds when the user chose "always"
    pub timestamp: i64,
    pub choice: StoredChoice,
    pub policy: SandboxPolicy,
    /// Credential access approved together with the policy
    #[serde(default)]
    pub allow_credentials: bool,
}

impl PermissionRecord {
    pub fn always(policy: SandboxPolicy, allow_credentials: bool) -> Self {
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            choice: StoredChoice::Always,
            policy,
            allow_credentials,
        }
    }

    pub fn granted_at(&self) -> Option<chrono::DateTime<chrono::Utc>> {
        chrono::DateTime::from_timestamp_millis(self.timestamp)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TrustStoreFile {
    #[serde(default)]
    trusted_apps: BTreeMap<AppId, PermissionRecord>,
}

#[derive(Debug, Clone)]
pub struct TrustStore {
    path: PathBuf,
}

impl TrustStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn open(paths: &Paths) -> Self {
        Self::new(paths.trust_store())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored record for `app`, if the user chose "always" for it.
    pub fn get(&self, app: &AppId) -> Result<Option<PermissionRecord>> {
        Ok(self.load()?.trusted_apps.remove(app))
    }

    /// All stored records, ordered by identifier.
    pub fn list(&self) -> Result<Vec<(AppId, PermissionRecord)>> {
        Ok(self.load()?.trusted_apps.into_iter().collect())
    }

    /// Persist an "always" decision, replacing any earlier one.
    pub fn grant(&self, app: &AppId, record: PermissionRecord) -> Result<()> {
        let mut file = self.load()?;
        file.trusted_apps.insert(app.clone(), record);
        self.save(&file)
    }

    /// Forget the decision for `app`. Returns whether one existed.
    pub fn revoke(&self, app: &AppId) -> Result<bool> {
        let mut file = self.load()?;
        if file.trusted_apps.remove(app).is_none() {
            return Ok(false);
        }
        self.save(&file)?;
        Ok(true)
    }

    /// Forget every decision. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let file = self.load()?;
        let removed = file.trusted_apps.len();
        if removed > 0 {
            self.save(&TrustStoreFile::default())?;
        }
        Ok(removed)
    }

    fn load(&self) -> Result<TrustStoreFile> {
        if !self.path.exists() {
            return Ok(TrustStoreFile::default());
        }

        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read trust store: {}", self.path.display()))?;

        match serde_json::from_str(&content) {
            Ok(file) => Ok(file),
            Err(e) => {
                warn!(
                    "Trust store {} is unreadable, treating it as empty: {}",
                    self.path.display(),
                    e
                );
                Ok(TrustStoreFile::default())
            }
        }
    }

    fn save(&self, file: &TrustStoreFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            create_dir_with_mode(parent)?;
        }

        let content = serde_json::to_string_pretty(file)?;

        let tmp_path = self.path.with_extension(format!(
            "{}.{}.tmp",
            std::process::id(),
            uuid::Uuid::new_v4().as_simple()
        ));
        fs::write(&tmp_path, &content)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&tmp_path, fs::Permissions::from_mode(0o600))?;
        }

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e)
                .with_context(|| format!("Failed to replace {}", self.path.display()));
        }

        debug!(
            "Saved trust store with {} app(s) to {}",
            file.trusted_apps.len(),
            self.path.display()
        );
        Ok(())
    }
}
