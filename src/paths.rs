//! XDG Base Directory Specification compliant path resolution.
//!
//! Every directory is resolved through a three-level fallback:
//! 1. kly-specific env var (KLY_CONFIG_DIR, KLY_STATE_DIR)
//! 2. XDG env var (XDG_CONFIG_HOME, etc.) via `etcetera`
//! 3. Platform default (~/.config, etc.)
//!
//! All paths are absolute. Relative paths from env vars are ignored per XDG spec.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolved directory paths for the host process.
///
/// Created once at startup and carried by the execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Home directory of the invoking user
    pub home: PathBuf,

    /// Config directory: config.toml and the trust store live here
    pub config_dir: PathBuf,

    /// State directory: permission audit log
    pub state_dir: PathBuf,
}

impl Paths {
    /// Resolve all paths using real environment variables.
    pub fn resolve() -> Result<Self> {
        Self::resolve_with_env(|key| std::env::var(key))
    }

    /// Resolve paths with a custom env var lookup (for testing).
    pub fn resolve_with_env<F>(env_fn: F) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        use etcetera::BaseStrategy;

        let strategy = etcetera::choose_base_strategy()
            .map_err(|e| anyhow::anyhow!("Failed to determine base directories: {}", e))?;

        let config_dir = env_or(&env_fn, "KLY_CONFIG_DIR", || {
            strategy.config_dir().join("kly")
        });

        let state_dir = env_or(&env_fn, "KLY_STATE_DIR", || {
            let base_state = strategy.state_dir().unwrap_or_else(|| strategy.data_dir());
            base_state.join("kly")
        });

        Ok(Self {
            home: strategy.home_dir().to_path_buf(),
            config_dir,
            state_dir,
        })
    }

    /// Build paths rooted at explicit directories (tests, embedding).
    pub fn rooted(home: &Path, config_dir: &Path, state_dir: &Path) -> Self {
        Self {
            home: home.to_path_buf(),
            config_dir: config_dir.to_path_buf(),
            state_dir: state_dir.to_path_buf(),
        }
    }

    /// Config file: config_dir/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    /// Trust store: config_dir/permissions.json
    pub fn trust_store(&self) -> PathBuf {
        self.config_dir.join("permissions.json")
    }

    /// Permission decision audit log: state_dir/permissions.audit.jsonl
    pub fn audit_log(&self) -> PathBuf {
        self.state_dir.join("permissions.audit.jsonl")
    }

    /// Create config and state directories with owner-only permissions.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.config_dir, &self.state_dir] {
            create_dir_with_mode(dir)?;
        }
        Ok(())
    }
}

/// Resolve an env var with fallback. Ignores empty and relative paths per XDG spec.
fn env_or<F>(env_fn: &F, var: &str, default: impl FnOnce() -> PathBuf) -> PathBuf
where
    F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
{
    env_fn(var)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .filter(|p| p.is_absolute()) // XDG spec: ignore relative paths
        .unwrap_or_else(default)
}

/// Create a directory with mode 0700 per XDG spec.
pub(crate) fn create_dir_with_mode(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .with_context(|| format!("Failed to create directory: {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Helper: build an env_fn from a HashMap
    fn make_env(
        map: HashMap<&str, &str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn default_paths_are_xdg_compliant() {
        let paths = Paths::resolve_with_env(make_env(HashMap::new())).unwrap();

        assert!(paths.config_dir.ends_with("kly"), "{:?}", paths.config_dir);
        assert!(paths.state_dir.ends_with("kly"), "{:?}", paths.state_dir);
        assert!(paths.home.is_absolute());
    }

    #[test]
    fn kly_env_vars_override_xdg() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("KLY_CONFIG_DIR", "/custom/config");
        env.insert("KLY_STATE_DIR", "/custom/state");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert_eq!(paths.config_dir, PathBuf::from("/custom/config"));
        assert_eq!(paths.state_dir, PathBuf::from("/custom/state"));
        assert_eq!(
            paths.trust_store(),
            PathBuf::from("/custom/config/permissions.json")
        );
    }

    #[test]
    fn relative_and_empty_paths_are_ignored() {
        let mut env: HashMap<&str, &str> = HashMap::new();
        env.insert("KLY_CONFIG_DIR", "relative/path");
        env.insert("KLY_STATE_DIR", "");

        let paths = Paths::resolve_with_env(make_env(env)).unwrap();
        assert!(paths.config_dir.is_absolute());
        assert!(paths.state_dir.is_absolute());
    }

    #[test]
    fn ensure_dirs_creates_private_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = Paths::rooted(
            tmp.path(),
            &tmp.path().join("cfg"),
            &tmp.path().join("state"),
        );
        paths.ensure_dirs().unwrap();
        assert!(paths.config_dir.is_dir());
        assert!(paths.state_dir.is_dir());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&paths.config_dir)
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
