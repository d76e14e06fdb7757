//! Isolation engine seam.
//!
//! An engine takes the command that starts the sandbox executor and rewrites
//! it so the resulting process is confined by a [`SandboxPolicy`]. The
//! primitives themselves live in the platform modules.

use anyhow::Result;
use std::path::PathBuf;

use super::policy::SandboxPolicy;
use crate::config::EngineChoice;

/// argv[0] the executor is started with when the engine allows setting it.
pub const SANDBOX_ARG0: &str = "kly-sandbox";

/// First argument of the executor command, for wrappers that cannot set argv[0].
pub const SANDBOX_CHILD_FLAG: &str = "--sandbox-child";

/// Carries the serialized policy from host to executor (Linux).
pub const SANDBOX_POLICY_ENV: &str = "KLY_SANDBOX_POLICY";

/// A command line about to be spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub arg0: Option<String>,
}

impl SandboxCommand {
    /// The command that re-executes `exe` as the sandbox executor.
    pub fn executor(exe: PathBuf, env: Vec<(String, String)>) -> Self {
        Self {
            program: exe,
            args: vec![SANDBOX_CHILD_FLAG.to_string()],
            env,
            arg0: Some(SANDBOX_ARG0.to_string()),
        }
    }

    /// Build the process. `env` is the whole environment; nothing is
    /// inherited from this process.
    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd.env_clear();
        cmd.envs(self.env.iter().map(|(k, v)| (k, v)));
        if let Some(ref arg0) = self.arg0 {
            cmd.arg0(arg0);
        }
        cmd
    }
}

pub trait IsolationEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this engine can confine processes on this machine.
    fn is_supported(&self) -> bool;

    /// Parts of `policy` this engine cannot enforce exactly.
    fn limitations(&self, _policy: &SandboxPolicy) -> Vec<String> {
        Vec::new()
    }

    fn wrap(&self, command: SandboxCommand, policy: &SandboxPolicy) -> Result<SandboxCommand>;
}

/// Runs commands as-is.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfinedEngine;

impl IsolationEngine for UnconfinedEngine {
    fn name(&self) -> &'static str {
        "none"
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn wrap(&self, command: SandboxCommand, _policy: &SandboxPolicy) -> Result<SandboxCommand> {
        Ok(command)
    }
}

/// Engine for the configured choice on this platform.
pub fn select_engine(choice: EngineChoice) -> Box<dyn IsolationEngine> {
    match choice {
        EngineChoice::None => Box::new(UnconfinedEngine),
        EngineChoice::Auto | EngineChoice::Native => native_engine(choice),
    }
}

#[cfg(target_os = "linux")]
fn native_engine(_choice: EngineChoice) -> Box<dyn IsolationEngine> {
    Box::new(super::linux::LandlockEngine)
}

#[cfg(target_os = "macos")]
fn native_engine(_choice: EngineChoice) -> Box<dyn IsolationEngine> {
    Box::new(super::macos::SeatbeltEngine)
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn native_engine(choice: EngineChoice) -> Box<dyn IsolationEngine> {
    if choice == EngineChoice::Native {
        tracing::warn!("No native sandbox engine on this platform");
    }
    Box::new(UnconfinedEngine)
}

/// Whether `arg0`/`first_arg` mark this process as the sandbox executor.
pub fn is_executor_invocation(arg0: Option<&str>, first_arg: Option<&str>) -> bool {
    arg0.is_some_and(|a| a.ends_with(SANDBOX_ARG0)) || first_arg == Some(SANDBOX_CHILD_FLAG)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_command_shape() {
        let cmd = SandboxCommand::executor("/usr/bin/kly".into(), vec![("A".into(), "1".into())]);
        assert_eq!(cmd.args, vec![SANDBOX_CHILD_FLAG.to_string()]);
        assert_eq!(cmd.arg0.as_deref(), Some(SANDBOX_ARG0));
    }

    #[test]
    fn command_environment_is_exactly_the_given_one() {
        let cmd = SandboxCommand::executor("/usr/bin/kly".into(), vec![("A".into(), "1".into())]);
        let tokio_cmd = cmd.to_tokio();
        let envs: Vec<_> = tokio_cmd.as_std().get_envs().collect();
        assert_eq!(envs, vec![(std::ffi::OsStr::new("A"), Some(std::ffi::OsStr::new("1")))]);
    }

    #[test]
    fn detects_executor_invocation() {
        assert!(is_executor_invocation(Some("/tmp/kly-sandbox"), None));
        assert!(is_executor_invocation(Some("/usr/bin/kly"), Some("--sandbox-child")));
        assert!(!is_executor_invocation(Some("/usr/bin/kly"), Some("run")));
        assert!(!is_executor_invocation(None, None));
    }

    #[test]
    fn none_choice_is_unconfined() {
        let engine = select_engine(EngineChoice::None);
        assert_eq!(engine.name(), "none");
        assert!(!engine.is_supported());
    }
}
