//! Linux confinement: Landlock for the filesystem, seccomp for the network.
//!
//! The wrapped command carries the policy as JSON in [`SANDBOX_POLICY_ENV`];
//! the executor applies it to itself before starting any threads, and the
//! script inherits the restrictions.
//!
//! Landlock only expresses allow rules, so deny lists are enforced by carving:
//! a tree that contains a denied path is not granted whole, its children are
//! granted one by one instead, skipping the denied ones.

use anyhow::{Context, Result};
use landlock::{
    ABI, Access, AccessFs, BitFlags, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreated,
    RulesetCreatedAttr, RulesetStatus,
};
use nix::libc;
use std::path::{Path, PathBuf};

use super::detect::detect_capabilities;
use super::engine::{IsolationEngine, SANDBOX_POLICY_ENV, SandboxCommand};
use super::policy::{NetworkAccess, SandboxPolicy, resolve_on_disk};

/// Always writable: /dev/null, terminals.
const DEVICE_DIR: &str = "/dev";

#[derive(Debug, Clone, Copy, Default)]
pub struct LandlockEngine;

impl IsolationEngine for LandlockEngine {
    fn name(&self) -> &'static str {
        "landlock"
    }

    fn is_supported(&self) -> bool {
        detect_capabilities().landlock_abi.is_some()
    }

    fn limitations(&self, policy: &SandboxPolicy) -> Vec<String> {
        let mut limits = Vec::new();
        if let NetworkAccess::AllowList(ref domains) = policy.allowed_domains
            && !domains.is_empty()
        {
            limits.push(format!(
                "Network cannot be limited to specific domains on Linux; {} allowed domain(s) grant general network access",
                domains.len()
            ));
        }
        if policy.allowed_domains.is_disabled() && !detect_capabilities().seccomp_available {
            limits.push("seccomp unavailable; network access is not blocked".to_string());
        }
        limits
    }

    fn wrap(&self, mut command: SandboxCommand, policy: &SandboxPolicy) -> Result<SandboxCommand> {
        let json = serde_json::to_string(policy).context("Failed to serialize sandbox policy")?;
        command.env.push((SANDBOX_POLICY_ENV.to_string(), json));
        Ok(command)
    }
}

/// Confine the current process: NO_NEW_PRIVS, then Landlock, then seccomp.
///
/// Must run while the process is still single-threaded. seccomp goes last
/// because it may block syscalls the Landlock setup needs.
pub fn apply_policy(policy: &SandboxPolicy) -> Result<(), String> {
    set_no_new_privs()?;

    if let Err(e) = apply_landlock(policy) {
        eprintln!("kly-sandbox: filesystem confinement not applied: {}", e);
    }

    if policy.allowed_domains.is_disabled()
        && let Err(e) = apply_seccomp_network_deny()
    {
        eprintln!("kly-sandbox: network confinement not applied: {}", e);
    }

    Ok(())
}

fn set_no_new_privs() -> Result<(), String> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(format!(
            "PR_SET_NO_NEW_PRIVS failed: {}",
            std::io::Error::last_os_error()
        ));
    }
    Ok(())
}

fn read_access() -> BitFlags<AccessFs> {
    AccessFs::from_read(ABI::V5)
}

fn write_access() -> BitFlags<AccessFs> {
    AccessFs::from_all(ABI::V5)
}

/// Access rights that apply to a non-directory.
fn file_access(access: BitFlags<AccessFs>) -> BitFlags<AccessFs> {
    access & AccessFs::from_file(ABI::V5)
}

fn apply_landlock(policy: &SandboxPolicy) -> Result<(), String> {
    let mut ruleset = Ruleset::default()
        .handle_access(AccessFs::from_all(ABI::V5))
        .map_err(|e| format!("Landlock ruleset creation: {}", e))?
        .create()
        .map_err(|e| format!("Landlock ruleset create: {}", e))?;

    for grant in plan_rules(policy) {
        add_rule(&mut ruleset, &grant.path, grant.access);
    }

    let status = ruleset
        .restrict_self()
        .map_err(|e| format!("Landlock restrict_self: {}", e))?;

    match status.ruleset {
        RulesetStatus::FullyEnforced => {}
        RulesetStatus::PartiallyEnforced => {
            eprintln!("kly-sandbox: Landlock partially enforced (ABI downgrade)");
        }
        RulesetStatus::NotEnforced => {
            return Err("Landlock not enforced by kernel".to_string());
        }
    }
    Ok(())
}

fn add_rule(ruleset: &mut RulesetCreated, path: &Path, access: BitFlags<AccessFs>) {
    let Ok(fd) = PathFd::new(path) else {
        return;
    };
    let access = if path.is_dir() {
        access
    } else {
        file_access(access)
    };
    let _ = ruleset.add_rule(PathBeneath::new(fd, access));
}

/// One Landlock rule to add.
#[derive(Debug, Clone, PartialEq)]
struct Grant {
    path: PathBuf,
    access: BitFlags<AccessFs>,
}

/// Rules implementing `policy`: read everything except `deny_read`, write
/// `allow_write` except `deny_write`.
///
/// Every path is compared in its resolved form, the one the kernel will see.
fn plan_rules(policy: &SandboxPolicy) -> Vec<Grant> {
    let resolved = |paths: &[PathBuf]| -> Vec<PathBuf> {
        paths.iter().map(|p| resolve_on_disk(p)).collect()
    };
    let deny_read = resolved(&policy.deny_read);

    let mut grants = Vec::new();
    carve(Path::new("/"), read_access(), &deny_read, &mut grants);

    let mut denied_writes = resolved(&policy.deny_write);
    denied_writes.extend(deny_read);
    for root in resolved(&policy.allow_write) {
        carve(&root, write_access(), &denied_writes, &mut grants);
    }

    grants.push(Grant {
        path: PathBuf::from(DEVICE_DIR),
        access: write_access(),
    });
    grants
}

fn carve(root: &Path, access: BitFlags<AccessFs>, denied: &[PathBuf], out: &mut Vec<Grant>) {
    if denied.iter().any(|d| root.starts_with(d)) || !root.exists() {
        return;
    }

    if !denied.iter().any(|d| d.starts_with(root)) {
        out.push(Grant {
            path: root.to_path_buf(),
            access,
        });
        return;
    }

    // A denied path lies below: list the directory itself, recurse per entry.
    out.push(Grant {
        path: root.to_path_buf(),
        access: access & AccessFs::ReadDir,
    });
    let Ok(entries) = std::fs::read_dir(root) else {
        return;
    };
    let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok()).map(|e| e.path()).collect();
    children.sort();
    for child in children {
        carve(&child, access, denied, out);
    }
}

/// Deny creation of IPv4/IPv6 sockets, and ptrace.
///
/// Unix sockets stay usable: the executor's channels are Unix sockets.
fn apply_seccomp_network_deny() -> Result<(), String> {
    use seccompiler::{
        BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition,
        SeccompFilter, SeccompRule, TargetArch,
    };
    use std::collections::BTreeMap;

    let family_rule = |family: i32| -> Result<SeccompRule, String> {
        let condition =
            SeccompCondition::new(0, SeccompCmpArgLen::Dword, SeccompCmpOp::Eq, family as u64)
                .map_err(|e| format!("seccomp condition: {}", e))?;
        SeccompRule::new(vec![condition]).map_err(|e| format!("seccomp rule: {}", e))
    };

    let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
    rules.insert(
        libc::SYS_socket,
        vec![family_rule(libc::AF_INET)?, family_rule(libc::AF_INET6)?],
    );
    // An empty rule list matches the syscall unconditionally.
    rules.insert(libc::SYS_ptrace, vec![]);

    let target_arch: TargetArch = std::env::consts::ARCH
        .try_into()
        .map_err(|e: seccompiler::BackendError| format!("seccomp unsupported arch: {}", e))?;

    let filter = SeccompFilter::new(
        rules,
        SeccompAction::Allow,
        SeccompAction::Errno(libc::EPERM as u32),
        target_arch,
    )
    .map_err(|e| format!("seccomp filter creation: {}", e))?;

    let bpf: BpfProgram = filter
        .try_into()
        .map_err(|e: seccompiler::BackendError| format!("seccomp BPF compilation: {}", e))?;

    seccompiler::apply_filter(&bpf).map_err(|e| format!("seccomp apply_filter: {}", e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    // Enforcement itself would confine the test process; only planning is
    // tested here.

    fn policy(allow_write: Vec<PathBuf>, deny_write: Vec<PathBuf>, deny_read: Vec<PathBuf>) -> SandboxPolicy {
        SandboxPolicy {
            allowed_domains: NetworkAccess::AllowList(vec![]),
            denied_domains: vec![],
            allow_write,
            deny_write,
            deny_read,
        }
    }

    fn granted(grants: &[Grant], path: &Path) -> Option<BitFlags<AccessFs>> {
        grants.iter().find(|g| g.path == path).map(|g| g.access)
    }

    #[test]
    fn carving_skips_denied_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("project/src")).unwrap();
        fs::create_dir_all(root.join(".ssh")).unwrap();
        fs::create_dir_all(root.join(".config/kly")).unwrap();
        fs::create_dir_all(root.join(".config/other")).unwrap();

        let p = policy(
            vec![root.to_path_buf()],
            vec![root.join(".ssh"), root.join(".config/kly")],
            vec![],
        );
        let mut grants = Vec::new();
        carve(root, write_access(), &p.deny_write, &mut grants);

        assert_eq!(granted(&grants, root), Some(write_access() & AccessFs::ReadDir));
        assert_eq!(granted(&grants, &root.join("project")), Some(write_access()));
        assert_eq!(granted(&grants, &root.join(".config/other")), Some(write_access()));
        assert!(granted(&grants, &root.join(".ssh")).is_none());
        assert!(granted(&grants, &root.join(".config/kly")).is_none());
    }

    #[test]
    fn write_root_inside_denied_tree_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join(".ssh")).unwrap();
        let mut grants = Vec::new();
        carve(
            &tmp.path().join(".ssh"),
            write_access(),
            &[tmp.path().join(".ssh")],
            &mut grants,
        );
        assert!(grants.is_empty());
    }

    #[test]
    fn plan_hides_denied_reads_from_writes_too() {
        let tmp = tempfile::tempdir().unwrap();
        let store = tmp.path().join("permissions.json");
        fs::write(&store, "{}").unwrap();
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();

        let p = policy(vec![tmp.path().to_path_buf()], vec![], vec![store.clone()]);
        let grants = plan_rules(&p);

        assert!(grants.iter().all(|g| g.path != store));
        assert!(granted(&grants, &tmp.path().join("notes.txt")).is_some());
        assert!(granted(&grants, Path::new(DEVICE_DIR)).is_some());
    }

    #[test]
    fn parent_dir_and_symlink_roots_cannot_cover_denied_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(tmp.path()).unwrap();
        let home = root.join("home");
        fs::create_dir_all(home.join(".ssh")).unwrap();
        fs::create_dir_all(home.join("work")).unwrap();
        std::os::unix::fs::symlink(&home, root.join("alias")).unwrap();

        let dotted = PathBuf::from(format!("/..{}", home.display()));
        let p = policy(vec![dotted, root.join("alias")], vec![home.join(".ssh")], vec![]);
        let grants = plan_rules(&p);

        let ssh = home.join(".ssh");
        for grant in grants.iter().filter(|g| g.access == write_access()) {
            assert!(
                !ssh.starts_with(&grant.path),
                "write grant on {} covers {}",
                grant.path.display(),
                ssh.display()
            );
        }
        assert_eq!(granted(&grants, &home.join("work")), Some(write_access()));
        assert!(grants.iter().all(|g| !g.path.starts_with(root.join("alias"))));
    }

    #[test]
    fn wrap_carries_policy_in_env() {
        let p = policy(vec![], vec![], vec![]);
        let cmd = SandboxCommand::executor("/bin/kly".into(), vec![]);
        let wrapped = LandlockEngine.wrap(cmd, &p).unwrap();
        let (_, json) = wrapped
            .env
            .iter()
            .find(|(k, _)| k == SANDBOX_POLICY_ENV)
            .unwrap();
        let back: SandboxPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn domain_allow_list_is_a_reported_limitation() {
        let mut p = policy(vec![], vec![], vec![]);
        p.allowed_domains = NetworkAccess::AllowList(vec!["api.example.com".into()]);
        let limits = LandlockEngine.limitations(&p);
        assert!(limits.iter().any(|l| l.contains("specific domains")));
    }
}
