use anyhow::Result;
use clap::{Args, Subcommand};
use std::sync::Arc;

use crate::app_id::AppId;
use crate::context::ExecutionContext;
use crate::ipc::protocol::ConfirmPrompt;
use crate::permissions::{AuditLog, PermissionBroker, PermissionRecord};
use crate::provider::{PromptAnswer, Prompter, TerminalPrompter, sanitize_for_terminal};
use crate::sandbox::NetworkAccess;

#[derive(Args)]
pub struct PermissionsArgs {
    #[command(subcommand)]
    pub command: PermissionsCommands,
}

#[derive(Subcommand)]
pub enum PermissionsCommands {
    /// List apps with an "always allow" decision
    List {
        /// Print the stored records as JSON
        #[arg(long)]
        json: bool,
    },

    /// Forget the decision for one app
    Revoke {
        /// App identifier, e.g. local:/path/to/app.sh or github.com/owner/repo@ref
        app_id: String,
    },

    /// Forget every stored decision
    Clear {
        /// Do not ask for confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Show the permission decision log
    Audit {
        /// Check the hash chain instead of printing entries
        #[arg(long)]
        verify: bool,

        /// Only show the last N entries
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },
}

pub async fn run(args: PermissionsArgs, ctx: &ExecutionContext) -> Result<()> {
    let prompter: Arc<dyn Prompter> = Arc::new(TerminalPrompter::new(ctx.interactive));
    let broker = PermissionBroker::from_context(ctx, prompter.clone());

    match args.command {
        PermissionsCommands::List { json } => list(&broker, json),
        PermissionsCommands::Revoke { app_id } => revoke(&broker, &app_id),
        PermissionsCommands::Clear { yes } => clear(&broker, prompter.as_ref(), yes).await,
        PermissionsCommands::Audit { verify, limit } => {
            audit(&AuditLog::new(ctx.paths.audit_log()), verify, limit)
        }
    }
}

fn list(broker: &PermissionBroker, json: bool) -> Result<()> {
    let records = broker.store().list()?;

    if json {
        let map: serde_json::Map<String, serde_json::Value> = records
            .iter()
            .map(|(app, record)| -> Result<(String, serde_json::Value)> {
                Ok((app.to_string(), serde_json::to_value(record)?))
            })
            .collect::<Result<_>>()?;
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }

    if records.is_empty() {
        println!("No apps are trusted permanently.");
        return Ok(());
    }

    for (app, record) in &records {
        println!("{}", sanitize_for_terminal(app.as_str()));
        print_record(record);
        println!();
    }
    println!("{} app(s)", records.len());
    Ok(())
}

fn print_record(record: &PermissionRecord) {
    let granted = record
        .granted_at()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    println!("  Granted:     {}", granted);
    println!(
        "  API keys:    {}",
        if record.allow_credentials { "yes" } else { "no" }
    );

    let network = match record.policy.allowed_domains {
        NetworkAccess::Unrestricted => "unrestricted".to_string(),
        NetworkAccess::AllowList(ref domains) if domains.is_empty() => "none".to_string(),
        NetworkAccess::AllowList(ref domains) => domains.join(", "),
    };
    println!("  Network:     {}", sanitize_for_terminal(&network));

    for path in &record.policy.allow_write {
        println!(
            "  Writable:    {}",
            sanitize_for_terminal(&path.to_string_lossy())
        );
    }
}

fn revoke(broker: &PermissionBroker, raw: &str) -> Result<()> {
    let app = AppId::parse(raw)?;
    if broker.revoke(&app)? {
        println!("Revoked stored permissions for {}", app);
    } else {
        println!("No stored permissions for {}", app);
    }
    Ok(())
}

async fn clear(broker: &PermissionBroker, prompter: &dyn Prompter, yes: bool) -> Result<()> {
    if !yes {
        let answer = prompter
            .confirm(&ConfirmPrompt {
                message: "Forget every stored permission decision?".to_string(),
                default: Some(false),
            })
            .await?;
        if !matches!(answer, PromptAnswer::Answered(true)) {
            println!("Nothing changed.");
            return Ok(());
        }
    }

    let removed = broker.clear()?;
    println!("Removed {} stored decision(s).", removed);
    Ok(())
}

fn audit(log: &AuditLog, verify: bool, limit: Option<usize>) -> Result<()> {
    if verify {
        let broken = log.verify()?;
        if broken.is_empty() {
            println!("Audit chain intact: {}", log.path().display());
        } else {
            println!("Audit chain broken at line(s):");
            for index in broken {
                println!("  {}", index + 1);
            }
        }
        return Ok(());
    }

    let entries = log.read()?;
    if entries.is_empty() {
        println!("No permission decisions recorded.");
        return Ok(());
    }

    let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
    for entry in entries.iter().skip(skip) {
        let action = serde_json::to_value(entry.action)?;
        let action = action.as_str().unwrap_or("unknown");
        let app = entry.app_id.as_deref().unwrap_or("-");
        match entry.detail {
            Some(ref detail) => println!(
                "{}  {:<15} {}  ({})",
                entry.ts,
                action,
                sanitize_for_terminal(app),
                sanitize_for_terminal(detail)
            ),
            None => println!("{}  {:<15} {}", entry.ts, action, sanitize_for_terminal(app)),
        }
    }
    Ok(())
}
