use anyhow::Result;

use super::executor::Executor;
use super::runner::ProcessScriptRunner;
use crate::ipc::channel::{IPC_FD_ENV, adopt_inherited_fd, fd_from_env};

/// Entry point for the sandbox executor process.
///
/// Called when the binary detects it was started as the executor (argv[0]
/// ending in "kly-sandbox", or a leading `--sandbox-child`). Confinement is
/// applied first, while the process is still single-threaded; only then is
/// the runtime built and the host channel adopted. Never returns.
pub fn sandbox_child_main() -> ! {
    #[cfg(target_os = "linux")]
    if let Err(e) = apply_inherited_policy() {
        eprintln!("kly-sandbox: failed to apply sandbox: {}", e);
        std::process::exit(1);
    }

    init_logging();

    let code = match run_executor() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("kly-sandbox: {:#}", e);
            1
        }
    };
    std::process::exit(code);
}

/// Apply the policy the launcher put in the environment, if any.
#[cfg(target_os = "linux")]
fn apply_inherited_policy() -> Result<(), String> {
    use super::engine::SANDBOX_POLICY_ENV;
    use super::policy::SandboxPolicy;

    let Ok(json) = std::env::var(SANDBOX_POLICY_ENV) else {
        return Ok(());
    };
    let policy: SandboxPolicy =
        serde_json::from_str(&json).map_err(|e| format!("failed to parse policy: {}", e))?;
    super::linux::apply_policy(&policy)
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_executor() -> Result<i32> {
    let fd = fd_from_env(IPC_FD_ENV)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let stream = adopt_inherited_fd(fd)?;
        let outcome = Executor::new(ProcessScriptRunner).run(stream).await;
        Ok::<_, anyhow::Error>(outcome.exit_code)
    })
}
