//! Sandboxed execution of untrusted apps.
//!
//! Uses the argv[0] re-exec pattern: the launcher re-executes the current
//! binary as the sandbox executor ("kly-sandbox"), wrapped by the platform's
//! isolation engine. The executor confines itself while still
//! single-threaded, then talks to the launcher over an inherited socket and
//! runs the app's script.
//!
//! Platform enforcement:
//! - Linux: Landlock LSM (filesystem) + seccomp-bpf (network syscall deny)
//! - macOS: Seatbelt SBPL profiles via sandbox-exec

pub mod child;
pub mod detect;
pub mod engine;
pub mod executor;
pub mod facade;
pub mod launcher;
#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "macos")]
pub mod macos;
pub mod policy;
pub mod runner;

pub use child::sandbox_child_main;
pub use detect::{SandboxCapabilities, detect_capabilities};
pub use engine::{
    IsolationEngine, SANDBOX_POLICY_ENV, SandboxCommand, UnconfinedEngine, is_executor_invocation,
    select_engine,
};
pub use executor::{Executor, ExecutorOutcome, ExecutorState};
pub use facade::{Facade, FacadeError, Resources};
pub use launcher::{LaunchError, LaunchOutcome, LaunchRequest, Launcher};
pub use policy::{NetworkAccess, PolicyBuilder, SandboxPolicy};
pub use runner::{ProcessScriptRunner, ScriptRunner};

/// Exit code for a run the user cancelled, distinct from failure.
pub const EXIT_CANCELLED: i32 = 130;
