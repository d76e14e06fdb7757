//! Stable identifiers for runnable apps, used as trust-store keys.
//!
//! - Local scripts: `local:<absolute-path>`
//! - Remote repositories: `<host>/<owner>/<repo>@<ref>`

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::context::ExecutionContext;

const LOCAL_PREFIX: &str = "local:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(String);

impl AppId {
    /// Identifier for a local script. `path` must already be absolute.
    pub fn local(path: &Path) -> Self {
        Self(format!("{}{}", LOCAL_PREFIX, path.display()))
    }

    /// Identifier for a remote repository at a specific ref.
    pub fn remote(host: &str, owner: &str, repo: &str, git_ref: &str) -> Self {
        Self(format!("{}/{}/{}@{}", host, owner, repo, git_ref))
    }

    /// Parse and validate an identifier string (e.g. from an env override or CLI).
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.chars().any(|c| c.is_control() || c.is_whitespace()) {
            bail!("App identifier contains whitespace or control characters");
        }

        if let Some(path) = raw.strip_prefix(LOCAL_PREFIX) {
            if !Path::new(path).is_absolute() {
                bail!("Local app identifier must hold an absolute path: {}", raw);
            }
            return Ok(Self(raw.to_string()));
        }

        let Some((repo_path, git_ref)) = raw.rsplit_once('@') else {
            bail!("Remote app identifier must look like host/owner/repo@ref: {}", raw);
        };
        let parts: Vec<&str> = repo_path.split('/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) || git_ref.is_empty() {
            bail!("Remote app identifier must look like host/owner/repo@ref: {}", raw);
        }

        Ok(Self(raw.to_string()))
    }

    /// Pick the identifier for a run.
    ///
    /// A remote override (set by the invoking CLI for repository runs) wins over
    /// a local override; without either, the script's absolute path is used.
    pub fn resolve(ctx: &ExecutionContext, script: &Path) -> Result<Self> {
        if let Some(ref remote) = ctx.remote_ref {
            return Self::parse(remote);
        }
        if let Some(ref local) = ctx.local_ref {
            return Self::parse(local);
        }
        Ok(Self::local(script))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_PREFIX)
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paths::Paths;
    use std::path::PathBuf;

    fn ctx(local: Option<&str>, remote: Option<&str>) -> ExecutionContext {
        let root = PathBuf::from("/home/u");
        ExecutionContext {
            paths: Paths::rooted(&root, &root.join(".config/kly"), &root.join(".state/kly")),
            cwd: root.clone(),
            trust_all: false,
            interactive: false,
            local_ref: local.map(String::from),
            remote_ref: remote.map(String::from),
            forwarded_env: vec![],
        }
    }

    #[test]
    fn local_identifier_format() {
        let id = AppId::local(Path::new("/opt/apps/hello.py"));
        assert_eq!(id.as_str(), "local:/opt/apps/hello.py");
        assert!(id.is_local());
    }

    #[test]
    fn remote_identifiers_differ_per_ref() {
        let a = AppId::remote("github.com", "acme", "tool", "v1.0.0");
        let b = AppId::remote("github.com", "acme", "tool", "v1.1.0");
        assert_eq!(a.as_str(), "github.com/acme/tool@v1.0.0");
        assert_ne!(a, b);
        assert!(!a.is_local());
    }

    #[test]
    fn parse_accepts_both_forms() {
        assert!(AppId::parse("local:/tmp/x.sh").is_ok());
        assert!(AppId::parse("github.com/acme/tool@main").is_ok());
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(AppId::parse("local:relative/x.sh").is_err());
        assert!(AppId::parse("github.com/acme@main").is_err());
        assert!(AppId::parse("github.com/acme/tool").is_err());
        assert!(AppId::parse("github.com/acme/tool@").is_err());
        assert!(AppId::parse("github.com/acme/to\x1bol@main").is_err());
    }

    #[test]
    fn resolve_prefers_remote_then_local_override() {
        let script = Path::new("/work/app.sh");

        let id = AppId::resolve(&ctx(None, None), script).unwrap();
        assert_eq!(id.as_str(), "local:/work/app.sh");

        let id = AppId::resolve(&ctx(Some("local:/elsewhere/app.sh"), None), script).unwrap();
        assert_eq!(id.as_str(), "local:/elsewhere/app.sh");

        let id = AppId::resolve(
            &ctx(Some("local:/elsewhere/app.sh"), Some("github.com/a/b@c")),
            script,
        )
        .unwrap();
        assert_eq!(id.as_str(), "github.com/a/b@c");
    }
}
