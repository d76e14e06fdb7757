//! Permission manifests: what an app declares it needs, read before it runs.
//!
//! Extraction is a host-side, no-execution pass. The app ships a `kly.json`
//! next to its entry script:
//!
//! ```json
//! {
//!   "permissions": {
//!     "apiKeys": true,
//!     "sandbox": {
//!       "network": { "allowedDomains": ["api.example.com"] },
//!       "filesystem": { "allowWrite": ["./out"], "denyRead": ["~/Documents"] }
//!     }
//!   }
//! }
//! ```
//!
//! A bare manifest object (without the `permissions` wrapper) is accepted too.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Manifest file looked up beside the entry script.
pub const MANIFEST_FILE: &str = "kly.json";

/// Sentinel meaning "the whole home directory" (filesystem) or "anywhere" (network).
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionManifest {
    /// Wants access to the user's LLM credentials
    #[serde(default)]
    pub api_keys: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<SandboxOverride>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxOverride {
    #[serde(default)]
    pub network: NetworkOverride,
    #[serde(default)]
    pub filesystem: FilesystemOverride,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkOverride {
    #[serde(default)]
    pub allowed_domains: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemOverride {
    #[serde(default)]
    pub allow_write: Vec<String>,
    #[serde(default)]
    pub deny_read: Vec<String>,
}

impl SandboxOverride {
    pub fn is_empty(&self) -> bool {
        self.network.allowed_domains.is_empty()
            && self.filesystem.allow_write.is_empty()
            && self.filesystem.deny_read.is_empty()
    }
}

impl PermissionManifest {
    /// Stand-in for an app whose manifest could not be read: assume it may
    /// want credentials, so the user is asked.
    pub fn undeclared() -> Self {
        Self {
            api_keys: true,
            sandbox: None,
        }
    }

    /// Requests nothing beyond the safe defaults.
    pub fn is_default_safe(&self) -> bool {
        !self.api_keys && self.sandbox.as_ref().is_none_or(SandboxOverride::is_empty)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ManifestFile {
    Wrapped { permissions: PermissionManifest },
    Bare(PermissionManifest),
}

/// Reads an app's declared permissions without executing any of its code.
pub trait ManifestSource: Send + Sync {
    fn extract(&self, script: &Path) -> Result<Option<PermissionManifest>>;
}

/// Looks for [`MANIFEST_FILE`] in the script's directory.
#[derive(Debug, Clone, Copy, Default)]
pub struct SidecarManifest;

impl SidecarManifest {
    pub fn manifest_path(script: &Path) -> Option<PathBuf> {
        script.parent().map(|dir| dir.join(MANIFEST_FILE))
    }
}

impl ManifestSource for SidecarManifest {
    fn extract(&self, script: &Path) -> Result<Option<PermissionManifest>> {
        let Some(path) = Self::manifest_path(script) else {
            return Ok(None);
        };
        if !path.exists() {
            debug!("No manifest at {}", path.display());
            return Ok(None);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest: {}", path.display()))?;
        let parsed: ManifestFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest: {}", path.display()))?;

        Ok(Some(match parsed {
            ManifestFile::Wrapped { permissions } => permissions,
            ManifestFile::Bare(manifest) => manifest,
        }))
    }
}

/// Extract a manifest, degrading any failure to "undeclared".
pub fn extract_or_undeclared(source: &dyn ManifestSource, script: &Path) -> Option<PermissionManifest> {
    match source.extract(script) {
        Ok(manifest) => manifest,
        Err(e) => {
            warn!("Could not read permission manifest, treating as undeclared: {:#}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn default_safe_classification() {
        assert!(PermissionManifest::default().is_default_safe());

        let empty_override = PermissionManifest {
            api_keys: false,
            sandbox: Some(SandboxOverride::default()),
        };
        assert!(empty_override.is_default_safe());

        assert!(!PermissionManifest::undeclared().is_default_safe());

        let wants_network = PermissionManifest {
            api_keys: false,
            sandbox: Some(SandboxOverride {
                network: NetworkOverride {
                    allowed_domains: vec!["example.com".into()],
                },
                ..Default::default()
            }),
        };
        assert!(!wants_network.is_default_safe());
    }

    #[test]
    fn reads_wrapped_and_bare_manifests() {
        let tmp = tempfile::tempdir().unwrap();
        let script = tmp.path().join("main.py");

        fs::write(
            tmp.path().join(MANIFEST_FILE),
            r#"{"permissions": {"apiKeys": true, "sandbox": {"filesystem": {"allowWrite": ["./out"]}}}}"#,
        )
        .unwrap();
        let manifest = SidecarManifest.extract(&script).unwrap().unwrap();
        assert!(manifest.api_keys);
        let sandbox = manifest.sandbox.unwrap();
        assert_eq!(sandbox.filesystem.allow_write, vec!["./out".to_string()]);
        assert!(sandbox.network.allowed_domains.is_empty());

        fs::write(tmp.path().join(MANIFEST_FILE), r#"{"apiKeys": false}"#).unwrap();
        let manifest = SidecarManifest.extract(&script).unwrap().unwrap();
        assert!(manifest.is_default_safe());
    }

    #[test]
    fn missing_manifest_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(SidecarManifest
            .extract(&tmp.path().join("main.sh"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn broken_manifest_degrades_to_undeclared() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(MANIFEST_FILE), "{ nope").unwrap();
        let script = tmp.path().join("main.sh");

        assert!(SidecarManifest.extract(&script).is_err());
        assert!(extract_or_undeclared(&SidecarManifest, &script).is_none());
    }
}
