use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{Config, EngineChoice};
use crate::context::ExecutionContext;
use crate::sandbox::policy::resolve_on_disk;
use crate::sandbox::{
    NetworkAccess, PolicyBuilder, SandboxPolicy, detect_capabilities, select_engine,
};

#[derive(Args)]
pub struct SandboxArgs {
    #[command(subcommand)]
    pub command: SandboxCommands,
}

#[derive(Subcommand)]
pub enum SandboxCommands {
    /// Show sandbox capabilities and configuration
    Status,

    /// Print the policy a default-safe app would run under
    Policy {
        /// Report how this path is treated instead of listing the policy
        #[arg(long)]
        path: Option<PathBuf>,
    },
}

pub async fn run(args: SandboxArgs, ctx: &ExecutionContext, config: &Config) -> Result<()> {
    match args.command {
        SandboxCommands::Status => run_status(config),
        SandboxCommands::Policy { path } => run_policy(ctx, path.as_deref()),
    }
}

fn run_status(config: &Config) -> Result<()> {
    let caps = detect_capabilities();

    println!("Sandbox Capabilities:");
    for line in caps.status_lines() {
        println!("{}", line);
    }
    println!();

    let engine = select_engine(config.sandbox.engine);
    println!("Configuration:");
    println!(
        "  Engine:      {} (config: {})",
        engine.name(),
        format_choice(config.sandbox.engine)
    );
    println!(
        "  Enforced:    {}",
        if engine.is_supported() { "yes" } else { "no, apps run unconfined" }
    );
    if !caps.network_enforced() {
        println!("  Network:     not blockable on this system");
    }

    Ok(())
}

fn run_policy(ctx: &ExecutionContext, path: Option<&Path>) -> Result<()> {
    let policy = PolicyBuilder::from_context(ctx).build(None);

    if let Some(path) = path {
        let resolved = resolve_on_disk(&ctx.cwd.join(path));
        println!("{}: {}", resolved.display(), describe_path(&policy, &resolved));
        return Ok(());
    }

    println!("Default policy:");
    match policy.allowed_domains {
        NetworkAccess::Unrestricted => println!("  Network:     unrestricted"),
        NetworkAccess::AllowList(ref domains) if domains.is_empty() => {
            println!("  Network:     none")
        }
        NetworkAccess::AllowList(ref domains) => println!("  Network:     {}", domains.join(", ")),
    }
    print_paths("Writable:", &policy.allow_write);
    print_paths("Never writable:", &policy.deny_write);
    print_paths("Hidden:", &policy.deny_read);

    Ok(())
}

fn describe_path(policy: &SandboxPolicy, path: &Path) -> &'static str {
    match (policy.is_read_denied(path), policy.is_write_allowed(path)) {
        (true, _) => "hidden",
        (false, true) => "writable",
        (false, false) => "read-only",
    }
}

fn print_paths(label: &str, paths: &[PathBuf]) {
    println!("  {}", label);
    for path in paths {
        println!("    {}", path.display());
    }
}

fn format_choice(choice: EngineChoice) -> &'static str {
    match choice {
        EngineChoice::Auto => "auto",
        EngineChoice::Native => "native",
        EngineChoice::None => "none",
    }
}
