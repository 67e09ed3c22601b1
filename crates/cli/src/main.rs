mod commands;
mod project_config;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize logging; stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("mcp_manager=warn".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(err) = run().await {
        print_error(&err);
        std::process::exit(1);
    }
}

/// Execute a command with automatic error context
macro_rules! run_command {
    ($name:expr, $cmd:expr) => {
        $cmd.await
            .with_context(|| format!("Command '{}' failed", $name))
    };
}

async fn run() -> anyhow::Result<()> {
    let cli = commands::Cli::parse();

    match cli.command {
        commands::Commands::Add(args) => run_command!("add", commands::add::run(args)),
        commands::Commands::Remove(args) => run_command!("remove", commands::remove::run(args)),
        commands::Commands::List(args) => run_command!("list", commands::list::run(args)),
        commands::Commands::Start(args) => run_command!("start", commands::start::run(args)),
        commands::Commands::Stop(args) => run_command!("stop", commands::stop::run(args)),
        commands::Commands::Status(args) => run_command!("status", commands::status::run(args)),
        commands::Commands::Sync(args) => run_command!("sync", commands::sync::run(args)),
        commands::Commands::Search(args) => run_command!("search", commands::search::run(args)),
        commands::Commands::Logs(args) => run_command!("logs", commands::logs::run(args)),
        commands::Commands::Paths => run_command!("paths", commands::paths::run()),
        commands::Commands::LogRelay(args) => commands::log_relay::run(args).await,
        commands::Commands::Completions { shell } => {
            commands::completions::run(shell);
            Ok(())
        }
    }
}

fn print_error(err: &anyhow::Error) {
    eprintln!("{} {}", "Error:".red().bold(), err);

    // Print the error chain
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  {} {}", "Caused by:".yellow(), cause);
        source = cause.source();
    }
}
