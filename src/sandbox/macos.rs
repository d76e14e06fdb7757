//! macOS confinement through Seatbelt profiles and `sandbox-exec`.

use anyhow::Result;

use super::detect::detect_capabilities;
use super::engine::{IsolationEngine, SandboxCommand};
use super::policy::{NetworkAccess, SandboxPolicy};

pub const SANDBOX_EXEC: &str = "/usr/bin/sandbox-exec";

#[derive(Debug, Clone, Copy, Default)]
pub struct SeatbeltEngine;

impl IsolationEngine for SeatbeltEngine {
    fn name(&self) -> &'static str {
        "seatbelt"
    }

    fn is_supported(&self) -> bool {
        detect_capabilities().seatbelt_available
    }

    fn limitations(&self, policy: &SandboxPolicy) -> Vec<String> {
        match policy.allowed_domains {
            NetworkAccess::AllowList(ref domains) if !domains.is_empty() => vec![format!(
                "Seatbelt cannot filter by domain; {} allowed domain(s) grant general network access",
                domains.len()
            )],
            _ => Vec::new(),
        }
    }

    /// `sandbox-exec -p <profile> <program> <args...>`. sandbox-exec cannot set
    /// argv[0], so the executor is recognised by its first argument.
    fn wrap(&self, command: SandboxCommand, policy: &SandboxPolicy) -> Result<SandboxCommand> {
        let mut args = vec![
            "-p".to_string(),
            generate_sbpl_profile(policy),
            command.program.to_string_lossy().into_owned(),
        ];
        args.extend(command.args);

        Ok(SandboxCommand {
            program: SANDBOX_EXEC.into(),
            args,
            env: command.env,
            arg0: None,
        })
    }
}

/// Seatbelt profile for `policy`.
///
/// Reads are broadly allowed (the dyld cache and frameworks are impractical to
/// enumerate) with `deny_read` carved out. Writes are limited to `allow_write`
/// minus `deny_write`. SBPL is last-match-wins, so the deny rules come last.
pub fn generate_sbpl_profile(policy: &SandboxPolicy) -> String {
    let mut rules = vec![
        "(version 1)".to_string(),
        "(deny default)".to_string(),
        "(allow process*)".to_string(),
        "(allow signal)".to_string(),
        "(allow mach*)".to_string(),
        "(allow ipc*)".to_string(),
        "(allow sysctl*)".to_string(),
        "(allow pseudo-tty)".to_string(),
        "(allow system-socket)".to_string(),
        "(allow file-read*)".to_string(),
        "(allow file-write* (subpath \"/dev\"))".to_string(),
    ];

    for path in &policy.allow_write {
        rules.push(format!(
            "(allow file-write* (subpath \"{}\"))",
            escape_sbpl_path(&path.to_string_lossy())
        ));
    }

    for path in &policy.deny_write {
        rules.push(format!(
            "(deny file-write* (subpath \"{}\"))",
            escape_sbpl_path(&path.to_string_lossy())
        ));
    }

    for path in &policy.deny_read {
        rules.push(format!(
            "(deny file-read* file-write* (subpath \"{}\"))",
            escape_sbpl_path(&path.to_string_lossy())
        ));
    }

    match policy.allowed_domains {
        NetworkAccess::Unrestricted => rules.push("(allow network*)".to_string()),
        NetworkAccess::AllowList(ref domains) if !domains.is_empty() => {
            rules.push("(allow network*)".to_string());
        }
        NetworkAccess::AllowList(_) => {}
    }

    rules.join("\n")
}

fn escape_sbpl_path(path: &str) -> String {
    path.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_policy(network: NetworkAccess) -> SandboxPolicy {
        SandboxPolicy {
            allowed_domains: network,
            denied_domains: vec![],
            allow_write: vec![PathBuf::from("/Users/test/project")],
            deny_write: vec![PathBuf::from("/Users/test/.ssh")],
            deny_read: vec![PathBuf::from("/Users/test/.config/kly/permissions.json")],
        }
    }

    #[test]
    fn profile_orders_denies_after_allows() {
        let profile = generate_sbpl_profile(&test_policy(NetworkAccess::AllowList(vec![])));
        let allow = profile.find("(allow file-write* (subpath \"/Users/test/project\"))").unwrap();
        let deny = profile.find("(deny file-write* (subpath \"/Users/test/.ssh\"))").unwrap();
        assert!(allow < deny);
        assert!(profile.contains("permissions.json"));
        assert!(!profile.contains("(allow network*)"));
    }

    #[test]
    fn unrestricted_network_is_allowed() {
        let profile = generate_sbpl_profile(&test_policy(NetworkAccess::Unrestricted));
        assert!(profile.contains("(allow network*)"));
    }

    #[test]
    fn wrap_prefixes_sandbox_exec() {
        let cmd = SandboxCommand::executor("/opt/kly".into(), vec![]);
        let wrapped = SeatbeltEngine
            .wrap(cmd, &test_policy(NetworkAccess::AllowList(vec![])))
            .unwrap();
        assert_eq!(wrapped.program, PathBuf::from(SANDBOX_EXEC));
        assert_eq!(wrapped.args[0], "-p");
        assert_eq!(wrapped.args[2], "/opt/kly");
        assert_eq!(wrapped.args[3], "--sandbox-child");
        assert!(wrapped.arg0.is_none());
    }

    #[test]
    fn escapes_quotes() {
        assert_eq!(escape_sbpl_path("/a\"b"), "/a\\\"b");
    }
}
