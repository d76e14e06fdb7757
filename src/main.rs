use anyhow::Result;
use clap::Parser;

use kly::cli::{self, Cli, Commands};
use kly::config::Config;
use kly::context::ExecutionContext;

fn main() -> Result<()> {
    // argv dispatch: if re-exec'd as the sandbox executor, enter the child path
    // immediately, before Tokio, Clap, or any other initialization.
    let mut argv = std::env::args_os();
    let arg0 = argv.next().map(|a| a.to_string_lossy().into_owned());
    let first = argv.next().map(|a| a.to_string_lossy().into_owned());
    if kly::sandbox::is_executor_invocation(arg0.as_deref(), first.as_deref()) {
        kly::sandbox::sandbox_child_main();
    }

    let cli = Cli::parse();

    let code = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))?;

    std::process::exit(code);
}

async fn async_main(cli: Cli) -> Result<i32> {
    let ctx = ExecutionContext::from_env()?;
    let config = Config::load(&ctx.paths)?;

    // Logs go to stderr; stdout belongs to the app.
    let log_level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run(args) => cli::run::run(args, &ctx, config).await,
        Commands::Permissions(args) => cli::permissions::run(args, &ctx).await.map(|_| 0),
        Commands::Paths => cli::paths::run(&ctx).map(|_| 0),
        Commands::Sandbox(args) => cli::sandbox::run(args, &ctx, &config).await.map(|_| 0),
    }
}
