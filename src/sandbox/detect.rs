/// Confinement primitives available on this machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCapabilities {
    /// Landlock ABI version (Linux only)
    pub landlock_abi: Option<u32>,

    /// seccomp-bpf present (Linux only)
    pub seccomp_available: bool,

    /// `/usr/bin/sandbox-exec` present (macOS only)
    pub seatbelt_available: bool,
}

/// Probe the current system for sandbox capabilities.
pub fn detect_capabilities() -> SandboxCapabilities {
    #[cfg(target_os = "linux")]
    {
        SandboxCapabilities {
            landlock_abi: probe_landlock_abi(),
            seccomp_available: probe_seccomp(),
            seatbelt_available: false,
        }
    }

    #[cfg(target_os = "macos")]
    {
        SandboxCapabilities {
            landlock_abi: None,
            seccomp_available: false,
            seatbelt_available: std::path::Path::new(super::macos::SANDBOX_EXEC).exists(),
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        SandboxCapabilities {
            landlock_abi: None,
            seccomp_available: false,
            seatbelt_available: false,
        }
    }
}

#[cfg(target_os = "linux")]
fn probe_landlock_abi() -> Option<u32> {
    use landlock::{ABI, Access, AccessFs, CompatLevel, Compatible, Ruleset, RulesetAttr};

    // Best-effort mode would accept any ABI; creating a hard-required ruleset
    // makes the kernel answer.
    for (abi, version) in [
        (ABI::V5, 5u32),
        (ABI::V4, 4),
        (ABI::V3, 3),
        (ABI::V2, 2),
        (ABI::V1, 1),
    ] {
        let created = Ruleset::default()
            .set_compatibility(CompatLevel::HardRequirement)
            .handle_access(AccessFs::from_all(abi))
            .and_then(|r| r.create());
        if created.is_ok() {
            return Some(version);
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn probe_seccomp() -> bool {
    std::fs::read_to_string("/proc/self/status")
        .map(|s| s.contains("Seccomp:"))
        .unwrap_or(false)
}

impl SandboxCapabilities {
    /// Whether the platform's native engine can confine a process.
    pub fn native_supported(&self) -> bool {
        self.landlock_abi.is_some() || self.seatbelt_available
    }

    /// Whether outbound network can be cut off.
    pub fn network_enforced(&self) -> bool {
        self.seccomp_available || self.seatbelt_available
    }

    /// Human-readable status lines for `kly sandbox status`.
    pub fn status_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();

        #[cfg(target_os = "linux")]
        {
            match self.landlock_abi {
                Some(abi) => lines.push(format!("  Landlock:  v{:<3}                    ok", abi)),
                None => lines.push("  Landlock:  not available           --".to_string()),
            }
            if self.seccomp_available {
                lines.push("  Seccomp:   available               ok".to_string());
            } else {
                lines.push("  Seccomp:   not available           --".to_string());
            }
        }

        #[cfg(target_os = "macos")]
        {
            if self.seatbelt_available {
                lines.push("  Seatbelt:  available               ok".to_string());
            } else {
                lines.push("  Seatbelt:  not available           --".to_string());
            }
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            lines.push("  Platform:  unsupported             --".to_string());
        }

        lines.push(format!(
            "  Confinement: {}",
            if self.native_supported() {
                "enforced"
            } else {
                "unavailable (apps run unconfined)"
            }
        ));

        lines
    }
}
