//! CLI subcommand: `kly paths`
//!
//! Prints the resolved locations of everything kly reads and writes.

use anyhow::Result;

use crate::context::ExecutionContext;

pub fn run(ctx: &ExecutionContext) -> Result<()> {
    let paths = &ctx.paths;

    println!("kly Paths");
    println!("=========");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!("  trust store:    {}", paths.trust_store().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  audit log:      {}", paths.audit_log().display());

    Ok(())
}
