use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::context::ExecutionContext;
use crate::paths::Paths;
use crate::permissions::manifest::{PermissionManifest, WILDCARD};

/// API hosts of the LLM providers an app may reach once granted credentials.
pub const LLM_API_DOMAINS: &[&str] = &[
    "api.anthropic.com",
    "api.openai.com",
    "generativelanguage.googleapis.com",
    "openrouter.ai",
    "api.deepseek.com",
    "api.mistral.ai",
    "api.groq.com",
    "api.x.ai",
];

/// Outbound network access for a sandboxed app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "domains", rename_all = "kebab-case")]
pub enum NetworkAccess {
    /// No restriction at all. Distinct from any allow-list, however large.
    Unrestricted,
    /// Only these hosts. Empty means no network.
    AllowList(Vec<String>),
}

impl NetworkAccess {
    pub fn is_disabled(&self) -> bool {
        matches!(self, NetworkAccess::AllowList(domains) if domains.is_empty())
    }
}

/// Confinement handed to the isolation engine.
///
/// Only ever produced by [`PolicyBuilder`]; the mandatory deny lists are
/// appended after every override so nothing can remove them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxPolicy {
    pub allowed_domains: NetworkAccess,
    pub denied_domains: Vec<String>,
    pub allow_write: Vec<PathBuf>,
    pub deny_write: Vec<PathBuf>,
    pub deny_read: Vec<PathBuf>,
}

impl SandboxPolicy {
    /// Whether a write to `path` would be permitted by this policy.
    pub fn is_write_allowed(&self, path: &Path) -> bool {
        let path = normalize_lexically(path);
        self.allow_write.iter().any(|allowed| path.starts_with(allowed))
            && !self.deny_write.iter().any(|denied| path.starts_with(denied))
    }

    /// Whether reads of `path` are blocked by this policy.
    pub fn is_read_denied(&self, path: &Path) -> bool {
        let path = normalize_lexically(path);
        self.deny_read.iter().any(|denied| path.starts_with(denied))
    }
}

/// Computes [`SandboxPolicy`] values from manifests.
///
/// Pure: the same builder and manifest always yield an identical policy.
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    cwd: PathBuf,
    home: PathBuf,
    config_dir: PathBuf,
    state_dir: PathBuf,
    trust_store: PathBuf,
    audit_log: PathBuf,
}

impl PolicyBuilder {
    pub fn new(paths: &Paths, cwd: &Path) -> Self {
        Self {
            cwd: resolve_on_disk(cwd),
            home: resolve_on_disk(&paths.home),
            config_dir: resolve_on_disk(&paths.config_dir),
            state_dir: resolve_on_disk(&paths.state_dir),
            trust_store: resolve_on_disk(&paths.trust_store()),
            audit_log: resolve_on_disk(&paths.audit_log()),
        }
    }

    pub fn from_context(ctx: &ExecutionContext) -> Self {
        Self::new(&ctx.paths, &ctx.cwd)
    }

    /// Build the policy for a manifest (`None` yields the defaults).
    pub fn build(&self, manifest: Option<&PermissionManifest>) -> SandboxPolicy {
        let mut unrestricted = false;
        let mut domains: Vec<String> = Vec::new();
        let mut allow_write = vec![self.cwd.clone()];
        let mut deny_read = vec![self.trust_store.clone(), self.audit_log.clone()];

        if let Some(manifest) = manifest {
            if manifest.api_keys {
                domains.extend(LLM_API_DOMAINS.iter().map(|d| d.to_string()));
            }

            if let Some(ref sandbox) = manifest.sandbox {
                for domain in &sandbox.network.allowed_domains {
                    if domain.trim() == WILDCARD {
                        unrestricted = true;
                    } else if let Some(domain) = normalize_domain(domain) {
                        domains.push(domain);
                    }
                }
                for path in &sandbox.filesystem.allow_write {
                    allow_write.push(self.resolve_path(path));
                }
                for path in &sandbox.filesystem.deny_read {
                    deny_read.push(self.resolve_path(path));
                }
            }
        }

        let allowed_domains = if unrestricted {
            NetworkAccess::Unrestricted
        } else {
            NetworkAccess::AllowList(dedup(domains))
        };

        SandboxPolicy {
            allowed_domains,
            denied_domains: Vec::new(),
            allow_write: dedup(allow_write),
            deny_write: self.mandatory_deny_write(),
            deny_read: dedup(deny_read),
        }
    }

    /// Policy for the bypass path: as open as possible, still protected.
    pub fn build_unrestricted(&self) -> SandboxPolicy {
        let mut policy = self.build(Some(&PermissionManifest {
            api_keys: true,
            sandbox: None,
        }));
        policy.allowed_domains = NetworkAccess::Unrestricted;
        policy.allow_write = dedup(vec![self.cwd.clone(), self.home.clone(), std::env::temp_dir()]);
        policy
    }

    /// Directories no app may ever write to.
    pub fn mandatory_deny_write(&self) -> Vec<PathBuf> {
        dedup(vec![
            self.config_dir.clone(),
            self.state_dir.clone(),
            self.home.join(".ssh"),
            self.home.join(".aws"),
            self.home.join(".azure"),
            self.home.join(".config").join("gcloud"),
            self.home.join(".kube"),
            self.home.join(".gnupg"),
        ])
    }

    /// Resolve a manifest path entry: `*` is the home directory, `~` expands to
    /// it, relative entries are taken from the invocation directory. Symlinks
    /// in the existing part of the path are resolved.
    fn resolve_path(&self, raw: &str) -> PathBuf {
        let raw = raw.trim();
        if raw == WILDCARD {
            return self.home.clone();
        }

        let expanded = shellexpand::tilde_with_context(raw, || self.home.to_str());
        let path = PathBuf::from(expanded.as_ref());
        if path.is_absolute() {
            resolve_on_disk(&path)
        } else {
            resolve_on_disk(&self.cwd.join(path))
        }
    }
}

fn normalize_domain(raw: &str) -> Option<String> {
    let domain = raw.trim().trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() { None } else { Some(domain) }
}

/// Resolve `.` and `..` without touching the filesystem.
///
/// `..` at the root stays at the root, as the kernel does.
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out
}

/// Normalize `path`, then resolve symlinks in its longest existing prefix.
///
/// The missing tail is appended unchanged; it holds no `..` after
/// normalization and cannot contain symlinks yet.
pub fn resolve_on_disk(path: &Path) -> PathBuf {
    let path = normalize_lexically(path);
    let mut existing = path.as_path();
    let mut tail = Vec::new();
    loop {
        if let Ok(real) = std::fs::canonicalize(existing) {
            let mut out = real;
            out.extend(tail.iter().rev().copied());
            return out;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name);
                existing = parent;
            }
            _ => return path.clone(),
        }
    }
}

fn dedup<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::manifest::{FilesystemOverride, NetworkOverride, SandboxOverride};

    fn builder() -> PolicyBuilder {
        let home = PathBuf::from("/home/user");
        let paths = Paths::rooted(
            &home,
            &home.join(".config/kly"),
            &home.join(".local/state/kly"),
        );
        PolicyBuilder::new(&paths, Path::new("/home/user/project"))
    }

    fn manifest(domains: &[&str], write: &[&str], deny_read: &[&str]) -> PermissionManifest {
        PermissionManifest {
            api_keys: false,
            sandbox: Some(SandboxOverride {
                network: NetworkOverride {
                    allowed_domains: domains.iter().map(|s| s.to_string()).collect(),
                },
                filesystem: FilesystemOverride {
                    allow_write: write.iter().map(|s| s.to_string()).collect(),
                    deny_read: deny_read.iter().map(|s| s.to_string()).collect(),
                },
            }),
        }
    }

    #[test]
    fn defaults_are_cwd_write_and_no_network() {
        let policy = builder().build(None);
        assert!(policy.allowed_domains.is_disabled());
        assert_eq!(policy.allow_write, vec![PathBuf::from("/home/user/project")]);
        assert!(policy
            .deny_read
            .contains(&PathBuf::from("/home/user/.config/kly/permissions.json")));
        assert!(policy.deny_write.contains(&PathBuf::from("/home/user/.ssh")));
        assert!(policy.deny_write.contains(&PathBuf::from("/home/user/.gnupg")));
        assert!(policy.deny_write.contains(&PathBuf::from("/home/user/.aws")));
    }

    #[test]
    fn api_keys_add_llm_domains() {
        let policy = builder().build(Some(&PermissionManifest {
            api_keys: true,
            sandbox: None,
        }));
        match policy.allowed_domains {
            NetworkAccess::AllowList(domains) => {
                assert!(domains.contains(&"api.anthropic.com".to_string()));
                assert!(domains.contains(&"api.openai.com".to_string()));
            }
            NetworkAccess::Unrestricted => panic!("api keys alone must not open the network"),
        }
    }

    #[test]
    fn network_wildcard_is_unrestricted() {
        let policy = builder().build(Some(&manifest(&["example.com", "*"], &[], &[])));
        assert_eq!(policy.allowed_domains, NetworkAccess::Unrestricted);
    }

    #[test]
    fn domains_are_normalized_and_deduplicated() {
        let policy = builder().build(Some(&manifest(
            &["API.Example.com.", "api.example.com", "  "],
            &[],
            &[],
        )));
        assert_eq!(
            policy.allowed_domains,
            NetworkAccess::AllowList(vec!["api.example.com".to_string()])
        );
    }

    #[test]
    fn filesystem_entries_are_resolved() {
        let policy = builder().build(Some(&manifest(
            &[],
            &["*", "./out", "~/cache", "/tmp/x/../y"],
            &["~/Documents"],
        )));
        assert_eq!(
            policy.allow_write,
            vec![
                PathBuf::from("/home/user/project"),
                PathBuf::from("/home/user"),
                PathBuf::from("/home/user/project/out"),
                PathBuf::from("/home/user/cache"),
                PathBuf::from("/tmp/y"),
            ]
        );
        assert!(policy.deny_read.contains(&PathBuf::from("/home/user/Documents")));
    }

    #[test]
    fn mandatory_protections_survive_explicit_overrides() {
        let policy = builder().build(Some(&manifest(
            &["*"],
            &["~/.config/kly", "~/.ssh", "*"],
            &[],
        )));
        let b = builder();
        for protected in b.mandatory_deny_write() {
            assert!(policy.deny_write.contains(&protected), "{:?}", protected);
        }
        assert!(!policy.is_write_allowed(Path::new("/home/user/.config/kly/permissions.json")));
        assert!(!policy.is_write_allowed(Path::new("/home/user/.ssh/authorized_keys")));
        assert!(!policy.is_write_allowed(Path::new("/home/user/project/../.ssh/config")));
        assert!(policy.is_write_allowed(Path::new("/home/user/notes.txt")));
        assert!(policy.is_read_denied(Path::new("/home/user/.config/kly/permissions.json")));
    }

    #[test]
    fn building_twice_is_identical() {
        let m = manifest(&["a.com", "b.com"], &["./o", "~/x"], &["~/y"]);
        let b = builder();
        let first = serde_json::to_vec(&b.build(Some(&m))).unwrap();
        let second = serde_json::to_vec(&b.build(Some(&m))).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn bypass_policy_keeps_mandatory_protections() {
        let b = builder();
        let policy = b.build_unrestricted();
        assert_eq!(policy.allowed_domains, NetworkAccess::Unrestricted);
        assert!(policy.allow_write.contains(&PathBuf::from("/home/user")));
        assert_eq!(policy.deny_write, b.mandatory_deny_write());
        assert!(!policy.is_write_allowed(Path::new("/home/user/.aws/credentials")));
    }

    #[test]
    fn policy_serialization_shape() {
        let policy = builder().build(None);
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["allowedDomains"]["mode"], "allow-list");
        assert!(json["denyWrite"].is_array());

        let unrestricted = serde_json::to_value(NetworkAccess::Unrestricted).unwrap();
        assert_eq!(unrestricted, serde_json::json!({"mode": "unrestricted"}));
    }

    #[test]
    fn normalize_handles_parent_and_current_components() {
        assert_eq!(
            normalize_lexically(Path::new("/a/./b/../c")),
            PathBuf::from("/a/c")
        );
        assert_eq!(normalize_lexically(Path::new("/../x")), PathBuf::from("/x"));
        assert_eq!(normalize_lexically(Path::new("/../../a/..")), PathBuf::from("/"));
        assert_eq!(normalize_lexically(Path::new("../a")), PathBuf::from("../a"));
    }

    #[test]
    fn manifest_paths_resolve_parent_dirs_and_symlinks() {
        let tmp = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(tmp.path()).unwrap();
        let home = root.join("home");
        let cwd = home.join("project");
        std::fs::create_dir_all(&cwd).unwrap();
        std::os::unix::fs::symlink(&home, cwd.join("up")).unwrap();

        let paths = Paths::rooted(&home, &home.join(".config/kly"), &home.join(".local/state/kly"));
        let b = PolicyBuilder::new(&paths, &cwd);
        let dotted = format!("/..{}", home.display());
        let policy = b.build(Some(&manifest(&[], &[&dotted, "up/docs"], &[])));

        assert!(policy.allow_write.contains(&home));
        assert!(policy.allow_write.contains(&home.join("docs")));
        assert!(policy.deny_write.contains(&home.join(".ssh")));
        assert!(!policy.is_write_allowed(&home.join(".ssh/authorized_keys")));
    }
}
