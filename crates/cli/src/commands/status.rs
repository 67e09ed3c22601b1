use super::{Context, StatusArgs};
use colored::Colorize;
use mcp_manager_core::{ServerState, StatusMonitor};

pub async fn run(args: StatusArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let manager = ctx.process_manager(ctx.manager_options())?;
    let records = ctx.store.list()?;

    let monitor = StatusMonitor::new(manager, ctx.config.settings.status_timeout());
    let statuses = monitor.status_all(&records).await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
        return Ok(());
    }

    if statuses.is_empty() {
        println!("No servers registered");
        println!(
            "\nUse {} to register a server",
            "mcp-manager add <name> -- <command>".cyan()
        );
        return Ok(());
    }

    println!("{}", "Servers:".bold());
    println!();

    for status in &statuses {
        let (dot, state) = match status.state {
            ServerState::Running => ("●".green(), "running".green()),
            ServerState::Starting => ("●".yellow(), "starting".yellow()),
            ServerState::Stopped => ("○".dimmed(), "stopped".dimmed()),
            ServerState::Error => ("●".red(), "error".red()),
        };
        println!("  {} {} [{}]", dot, status.name.bold(), state);

        let mut details = Vec::new();
        if let Some(pid) = status.pid {
            details.push(format!("PID: {}", pid));
        }
        if let Some(endpoint) = &status.endpoint {
            details.push(endpoint.clone());
        }
        if let Some(uptime) = status.uptime_secs {
            details.push(format!("Up: {}", format_uptime(uptime)));
        }
        if let Some(error) = &status.error {
            details.push(error.clone());
        }
        if !details.is_empty() {
            println!("    {}", details.join("  "));
        }
    }

    Ok(())
}

fn format_uptime(secs: u64) -> String {
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::format_uptime;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(5), "5s");
        assert_eq!(format_uptime(125), "2m 5s");
        assert_eq!(format_uptime(7260), "2h 1m");
    }
}
