//! Append-only, hash-chained log of permission decisions.
//!
//! Stored at `<state_dir>/permissions.audit.jsonl`. Each line is one JSON
//! entry carrying the SHA-256 of the previous raw line, so edits to earlier
//! lines break the chain.
//!
//! | Field | Description |
//! |-------|-------------|
//! | `ts` | RFC 3339 timestamp |
//! | `action` | `granted_once`, `granted_always`, `denied`, `revoked`, ... |
//! | `app_id` | App the decision applies to (absent for `cleared`) |
//! | `policy_sha256` | SHA-256 of the serialized policy, when there is one |
//! | `prev_entry_sha256` | SHA-256 of the previous line, zeros for the first |
//!
//! A corrupted last line is not fatal: a `chain_recovery` entry is written
//! first and the chain continues from it.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::app_id::AppId;
use crate::sandbox::policy::SandboxPolicy;

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: String,
    pub action: AuditAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_sha256: Option<String>,
    pub prev_entry_sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Trust-all override granted without asking
    Bypassed,
    /// A stored "always" record was reused
    Cached,
    /// Granted for this process from an earlier "once"
    SessionCached,
    /// Nothing beyond the defaults was requested
    DefaultSafe,
    GrantedOnce,
    GrantedAlways,
    Denied,
    Revoked,
    Cleared,
    /// Previous entry corrupted, new chain segment started
    ChainRecovery,
}

/// Writer/reader for the decision log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an event. Failures are logged and swallowed; auditing never
    /// blocks a decision.
    pub fn record(
        &self,
        action: AuditAction,
        app: Option<&AppId>,
        policy: Option<&SandboxPolicy>,
        detail: Option<&str>,
    ) {
        if let Err(e) = self.append(action, app, policy, detail) {
            warn!("Failed to write permission audit entry: {:#}", e);
        }
    }

    pub fn append(
        &self,
        action: AuditAction,
        app: Option<&AppId>,
        policy: Option<&SandboxPolicy>,
        detail: Option<&str>,
    ) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            crate::paths::create_dir_with_mode(parent)?;
        }

        let prev_hash = self.chain_head()?;

        let policy_sha256 = match policy {
            Some(p) => Some(sha256_hex(&serde_json::to_vec(p)?)),
            None => None,
        };

        let entry = AuditEntry {
            ts: chrono::Utc::now().to_rfc3339(),
            action,
            app_id: app.map(|a| a.to_string()),
            policy_sha256,
            prev_entry_sha256: prev_hash,
            detail: detail.map(String::from),
        };

        let json = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
        append_line(&self.path, &json)
    }

    /// Hash of the last line, writing a recovery entry first when that line
    /// is not a valid entry.
    fn chain_head(&self) -> Result<String> {
        if !self.path.exists() {
            return Ok(GENESIS_HASH.to_string());
        }

        let content = fs::read_to_string(&self.path).context("Failed to read audit log")?;
        let Some(last_line) = content.lines().rfind(|l| !l.is_empty()) else {
            return Ok(GENESIS_HASH.to_string());
        };

        if serde_json::from_str::<AuditEntry>(last_line).is_ok() {
            return Ok(sha256_hex(last_line.as_bytes()));
        }

        let recovery = AuditEntry {
            ts: chrono::Utc::now().to_rfc3339(),
            action: AuditAction::ChainRecovery,
            app_id: None,
            policy_sha256: None,
            prev_entry_sha256: sha256_hex(last_line.as_bytes()),
            detail: Some(format!(
                "Previous entry corrupted ({} bytes), new chain segment",
                last_line.len()
            )),
        };
        let recovery_json =
            serde_json::to_string(&recovery).context("Failed to serialize recovery entry")?;
        append_line(&self.path, &recovery_json)?;
        Ok(sha256_hex(recovery_json.as_bytes()))
    }

    /// Every parseable entry, oldest first. Corrupted lines are skipped.
    pub fn read(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).context("Failed to read audit log")?;
        Ok(content
            .lines()
            .filter(|l| !l.is_empty())
            .filter_map(|l| serde_json::from_str::<AuditEntry>(l).ok())
            .collect())
    }

    /// Line indices where the chain is broken. Empty means intact.
    pub fn verify(&self) -> Result<Vec<usize>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.path).context("Failed to read audit log")?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();

        let mut broken = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let Ok(entry) = serde_json::from_str::<AuditEntry>(line) else {
                broken.push(i);
                continue;
            };
            let expected = match i {
                0 => GENESIS_HASH.to_string(),
                _ => sha256_hex(lines[i - 1].as_bytes()),
            };
            if entry.prev_entry_sha256 != expected {
                broken.push(i);
            }
        }
        Ok(broken)
    }
}

fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).context("Failed to open audit log")?;
    writeln!(file, "{}", line).context("Failed to write audit entry")?;
    Ok(())
}

fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
