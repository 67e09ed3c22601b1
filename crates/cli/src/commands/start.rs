use super::{Context, StartArgs};
use crate::project_config::ProjectConfig;
use anyhow::Context as _;
use colored::Colorize;
use mcp_manager_core::{Error, LogCapture, ProcessManager};
use std::time::Duration;
use tracing::debug;

/// How often the foreground loop checks whether servers are still alive
const WATCH_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run(args: StartArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;

    let names = if args.servers.is_empty() {
        match &ctx.config.project_config_path {
            Some(path) => {
                let project = ProjectConfig::load(path)?;
                debug!("Loaded {} servers from {}", project.servers.len(), path.display());
                println!(
                    "{} Using servers from {}",
                    "▶".blue(),
                    path.display().to_string().dimmed()
                );
                project.servers
            }
            None => Vec::new(),
        }
    } else {
        args.servers.clone()
    };

    if names.is_empty() {
        return Err(anyhow::anyhow!(
            "No servers specified. Use 'mcp-manager start <server>' or list servers in mcp-manager.yaml"
        ));
    }

    let mut records = Vec::new();
    for name in &names {
        records.push(ctx.store.get(name)?);
    }

    // Detached servers log through a relay helper: this same binary
    let capture = if args.detach {
        LogCapture::Helper(
            std::env::current_exe().context("Cannot locate the mcp-manager executable")?,
        )
    } else {
        LogCapture::Relay
    };
    let mut options = ctx.manager_options().with_capture(capture);
    if let Some(pattern) = args.ready_pattern {
        options.ready_pattern = Some(pattern);
    }
    let manager = ctx.process_manager(options)?;

    let mut started = Vec::new();
    let mut failures = 0;
    for record in &records {
        println!("{} Starting {}...", "▶".blue(), record.name);

        match manager.start(record).await {
            Ok(handle) => {
                let target = match (handle.pid(), handle.endpoint()) {
                    (Some(pid), _) => format!("PID: {}", pid),
                    (None, Some(endpoint)) => endpoint.to_string(),
                    (None, None) => String::new(),
                };
                println!("{} {} running ({})", "✓".green(), record.name.bold(), target);
                started.push(record.name.clone());
            }
            Err(Error::AlreadyRunning(name)) => {
                println!("{} {} is already running", "⚠".yellow(), name);
            }
            Err(e) => {
                println!("{} {}: {}", "✗".red(), record.name, e);
                failures += 1;
            }
        }
    }

    if args.detach || started.is_empty() {
        if !started.is_empty() {
            println!();
            println!(
                "Use {} to follow output, {} to stop",
                "mcp-manager logs <server>".cyan(),
                "mcp-manager stop".cyan()
            );
        }
        if failures > 0 {
            anyhow::bail!("Failed to start {} server(s)", failures);
        }
        return Ok(());
    }

    println!();
    println!("Press {} to stop", "Ctrl+C".bold());
    watch(&manager, &started).await;

    let results = manager.shutdown().await;
    for (name, result) in results {
        match result {
            Ok(()) => println!("{} Stopped {}", "■".red(), name),
            Err(e) => println!("{} {}: {}", "✗".red(), name, e),
        }
    }

    if failures > 0 {
        anyhow::bail!("Failed to start {} server(s)", failures);
    }
    Ok(())
}

/// Block until Ctrl+C or until every started server has exited.
async fn watch(manager: &ProcessManager, started: &[String]) {
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interval = tokio::time::interval(WATCH_INTERVAL);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                println!();
                println!("{} Shutting down...", "■".red());
                return;
            }
            _ = interval.tick() => {
                if started.iter().all(|name| !manager.is_running(name)) {
                    println!("{} All servers exited", "●".cyan());
                    return;
                }
            }
        }
    }
}
