pub mod paths;
pub mod permissions;
pub mod run;
pub mod sandbox;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "kly")]
#[command(
    author,
    version,
    about = "Run untrusted scripts in an OS sandbox with brokered credentials and permissions"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an app script inside the sandbox
    Run(run::RunArgs),

    /// Inspect and manage remembered permission decisions
    Permissions(permissions::PermissionsArgs),

    /// Show resolved directory paths
    Paths,

    /// Sandbox diagnostics
    Sandbox(sandbox::SandboxArgs),
}
