use super::{Context, StopArgs};
use colored::Colorize;
use mcp_manager_core::server::normalize_name;
use mcp_manager_core::Error;

pub async fn run(args: StopArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let manager = ctx.process_manager(ctx.manager_options())?;

    let names: Vec<String> = if args.servers.is_empty() {
        manager.running().into_iter().map(|h| h.name).collect()
    } else {
        args.servers.iter().map(|n| normalize_name(n)).collect()
    };

    if names.is_empty() {
        println!("No servers running");
        return Ok(());
    }

    let mut failures = 0;
    for name in &names {
        match manager.stop(name).await {
            Ok(()) => println!("{} Stopped {}", "■".red(), name.bold()),
            Err(Error::NotRunning(_)) => println!("{} {} is not running", "⚠".yellow(), name),
            Err(e) => {
                println!("{} {}: {}", "✗".red(), name, e);
                failures += 1;
            }
        }
    }

    manager.wait_for_terminations().await;

    if failures > 0 {
        anyhow::bail!("Failed to stop {} server(s)", failures);
    }
    Ok(())
}
