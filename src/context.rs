//! Execution context, constructed once at process start.
//!
//! Everything that used to be sniffed from the environment at the point of use
//! (bypass flag, identifier overrides, TTY availability, directories) is read
//! here and passed down explicitly.

use anyhow::{Context, Result};
use std::io::IsTerminal;
use std::path::PathBuf;

use crate::app_id::AppId;
use crate::paths::Paths;

/// Enables the "trust everything" decision path for automation.
pub const TRUST_ALL_ENV: &str = "KLY_TRUST_ALL";

/// Local app identifier override for the duration of one run.
pub const LOCAL_REF_ENV: &str = "KLY_LOCAL_REF";

/// Remote app identifier override for the duration of one run.
pub const REMOTE_REF_ENV: &str = "KLY_REMOTE_REF";

/// Identifier of the running app, visible to the sandboxed script.
pub const APP_ID_ENV: &str = "KLY_APP_ID";

/// Host variables a sandboxed app still sees. Everything else, API keys
/// included, is withheld.
pub const FORWARDED_ENV: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    "COLORTERM",
    "NO_COLOR",
    "LANG",
    "LANGUAGE",
    "LC_ALL",
    "LC_CTYPE",
    "LC_MESSAGES",
    "LC_COLLATE",
    "LC_NUMERIC",
    "LC_TIME",
    "LC_MONETARY",
    "TZ",
    "TMPDIR",
    "RUST_LOG",
];

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub paths: Paths,

    /// Directory kly was invoked from
    pub cwd: PathBuf,

    /// Bypass override is active
    pub trust_all: bool,

    /// A human can answer prompts on this terminal
    pub interactive: bool,

    pub local_ref: Option<String>,

    pub remote_ref: Option<String>,

    /// Values of [`FORWARDED_ENV`] present at startup
    pub forwarded_env: Vec<(String, String)>,
}

impl ExecutionContext {
    /// Build the context from the real process environment.
    pub fn from_env() -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to determine current directory")?;
        let interactive = std::io::stdin().is_terminal() && std::io::stderr().is_terminal();
        Self::from_env_with(|key| std::env::var(key), cwd, interactive)
    }

    /// Build the context with a custom env var lookup (for testing).
    pub fn from_env_with<F>(env_fn: F, cwd: PathBuf, interactive: bool) -> Result<Self>
    where
        F: Fn(&str) -> std::result::Result<String, std::env::VarError>,
    {
        let paths = Paths::resolve_with_env(&env_fn)?;

        let non_empty = |key: &str| env_fn(key).ok().filter(|v| !v.trim().is_empty());

        Ok(Self {
            paths,
            cwd,
            trust_all: non_empty(TRUST_ALL_ENV).is_some_and(|v| parse_flag(&v)),
            interactive,
            local_ref: non_empty(LOCAL_REF_ENV),
            remote_ref: non_empty(REMOTE_REF_ENV),
            forwarded_env: FORWARDED_ENV
                .iter()
                .filter_map(|key| env_fn(key).ok().map(|v| (key.to_string(), v)))
                .collect(),
        })
    }

    /// The complete environment of the sandboxed child for one run.
    ///
    /// The host's own environment is never modified, so nothing needs restoring
    /// once the run ends.
    pub fn child_env(&self, app_id: &AppId) -> Vec<(String, String)> {
        let mut env = self.forwarded_env.clone();
        env.push((APP_ID_ENV.to_string(), app_id.to_string()));
        if let Some(ref local) = self.local_ref {
            env.push((LOCAL_REF_ENV.to_string(), local.clone()));
        }
        if let Some(ref remote) = self.remote_ref {
            env.push((REMOTE_REF_ENV.to_string(), remote.clone()));
        }
        env
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn make_env(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> std::result::Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_without_signals() {
        let ctx =
            ExecutionContext::from_env_with(make_env(HashMap::new()), "/w".into(), false).unwrap();
        assert!(!ctx.trust_all);
        assert!(ctx.local_ref.is_none());
        assert!(ctx.remote_ref.is_none());
        assert_eq!(ctx.cwd, PathBuf::from("/w"));
    }

    #[test]
    fn trust_all_flag_values() {
        for (value, expected) in [("1", true), ("TRUE", true), ("yes", true), ("0", false), ("nope", false)] {
            let mut env = HashMap::new();
            env.insert(TRUST_ALL_ENV, value);
            let ctx = ExecutionContext::from_env_with(make_env(env), "/w".into(), true).unwrap();
            assert_eq!(ctx.trust_all, expected, "value {value:?}");
        }
    }

    #[test]
    fn child_env_forwards_identifiers() {
        let mut env = HashMap::new();
        env.insert(REMOTE_REF_ENV, "github.com/a/b@main");
        env.insert(LOCAL_REF_ENV, "  ");
        let ctx = ExecutionContext::from_env_with(make_env(env), "/w".into(), true).unwrap();
        assert!(ctx.local_ref.is_none(), "blank override is ignored");

        let app = AppId::parse("github.com/a/b@main").unwrap();
        let child = ctx.child_env(&app);
        assert!(child.contains(&(APP_ID_ENV.to_string(), "github.com/a/b@main".to_string())));
        assert!(child.contains(&(REMOTE_REF_ENV.to_string(), "github.com/a/b@main".to_string())));
        assert!(!child.iter().any(|(k, _)| k == LOCAL_REF_ENV));
    }

    #[test]
    fn child_env_keeps_basics_and_drops_secrets() {
        let mut env = HashMap::new();
        env.insert("PATH", "/usr/bin:/bin");
        env.insert("LANG", "en_US.UTF-8");
        env.insert("ANTHROPIC_API_KEY", "sk-host-secret");
        env.insert("AWS_SECRET_ACCESS_KEY", "aws-secret");
        let ctx = ExecutionContext::from_env_with(make_env(env), "/w".into(), true).unwrap();

        let child = ctx.child_env(&AppId::local(std::path::Path::new("/w/app.sh")));
        assert!(child.contains(&("PATH".to_string(), "/usr/bin:/bin".to_string())));
        assert!(child.contains(&("LANG".to_string(), "en_US.UTF-8".to_string())));
        assert!(!child.iter().any(|(k, _)| k == "ANTHROPIC_API_KEY"));
        assert!(!child.iter().any(|(_, v)| v.contains("secret")));
    }
}
