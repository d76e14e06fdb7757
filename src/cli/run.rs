use anyhow::{Context, Result, bail};
use clap::Args;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

use crate::app_id::AppId;
use crate::config::Config;
use crate::context::ExecutionContext;
use crate::permissions::{PermissionBroker, SidecarManifest, extract_or_undeclared};
use crate::provider::{ConfigModelStore, Prompter, ResourceProvider, TerminalPrompter, sanitize_for_terminal};
use crate::sandbox::{EXIT_CANCELLED, LaunchRequest, Launcher, select_engine};

#[derive(Args)]
pub struct RunArgs {
    /// Script to run
    pub script: PathBuf,

    /// Arguments passed to the script
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Run one app and return the process exit code.
pub async fn run(args: RunArgs, ctx: &ExecutionContext, config: Config) -> Result<i32> {
    // One script gets one AppId however it was spelled on the command line.
    let joined = ctx.cwd.join(&args.script);
    let script = std::fs::canonicalize(&joined)
        .with_context(|| format!("Script not found: {}", joined.display()))?;
    if !script.is_file() {
        bail!("Script not found: {}", script.display());
    }
    ctx.paths.ensure_dirs()?;

    let prompter: Arc<dyn Prompter> = Arc::new(TerminalPrompter::new(ctx.interactive));
    let app_id = AppId::resolve(ctx, &script)?;
    let manifest = extract_or_undeclared(&SidecarManifest, &script);

    let broker = PermissionBroker::from_context(ctx, prompter.clone());
    let decision = broker.decide(&app_id, manifest.as_ref()).await?;
    if let Some(message) = decision.denial_message() {
        eprintln!("{}", message);
        return Ok(1);
    }
    debug!("{} granted ({:?})", app_id, decision.basis);

    let provider = Arc::new(ResourceProvider::new(
        Arc::new(ConfigModelStore::new(config.clone())),
        prompter,
        app_id.clone(),
        decision.allow_credentials,
    ));

    let launcher = Launcher::new(select_engine(config.sandbox.engine));
    let outcome = launcher
        .launch(
            LaunchRequest {
                script_path: script,
                args: args.args,
                app_id: app_id.clone(),
                invoke_dir: ctx.cwd.clone(),
                policy: decision.policy,
                allow_credentials: decision.allow_credentials,
                env: ctx.child_env(&app_id),
            },
            provider,
        )
        .await?;

    if let Some(ref result) = outcome.result {
        debug!("App result: {}", result);
    }

    if outcome.success {
        return Ok(outcome.exit_code);
    }
    if outcome.exit_code != EXIT_CANCELLED
        && let Some(ref error) = outcome.error
    {
        eprintln!("Error: {}", sanitize_for_terminal(error));
    }
    Ok(if outcome.exit_code == 0 { 1 } else { outcome.exit_code })
}
