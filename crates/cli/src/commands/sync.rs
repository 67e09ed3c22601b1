use super::{Context, SyncArgs};
use colored::Colorize;
use mcp_manager_core::{Client, SyncEngine, SyncReport};

pub async fn run(args: SyncArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let policy = args.policy.unwrap_or(ctx.config.settings.sync_policy);
    let engine = SyncEngine::new(&ctx.store, policy);

    if args.targets.is_empty() {
        return sync_all(&engine);
    }

    let mut failures = 0;
    for target in &args.targets {
        match engine.sync_named(target) {
            Ok(report) => print_report(&report),
            Err(e) => {
                // An unknown target fails the whole command up front
                if e.kind() == mcp_manager_core::ErrorKind::Sync {
                    return Err(e.into());
                }
                println!("{} {}: {}", "✗".red(), target, e);
                failures += 1;
            }
        }
    }

    if failures > 0 {
        anyhow::bail!("Failed to sync {} client(s)", failures);
    }
    Ok(())
}

/// Sync every client, printing one line per client.
pub fn sync_all(engine: &SyncEngine<'_>) -> anyhow::Result<()> {
    println!("{} Syncing clients ({} policy)...", "▶".blue(), engine.policy());

    let mut failures = Vec::new();
    for (client, result) in engine.sync_all() {
        match result {
            Ok(report) => print_report(&report),
            Err(e) => {
                println!("{} {}: {}", "✗".red(), client, e);
                failures.push(client);
            }
        }
    }

    if !failures.is_empty() {
        let names: Vec<&str> = failures.iter().map(Client::as_str).collect();
        anyhow::bail!("Failed to sync {}", names.join(", "));
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    let summary = format!(
        "{} added, {} updated, {} removed, {} preserved",
        report.added.len(),
        report.updated.len(),
        report.removed.len(),
        report.preserved.len()
    );
    let mark = if report.changed() {
        "✓".green()
    } else {
        "●".cyan()
    };
    println!(
        "{} {} {} ({})",
        mark,
        report.client.as_str().bold(),
        report.path.display().to_string().dimmed(),
        summary
    );

    for name in &report.skipped {
        println!(
            "  {} skipped {}: {} does not support remote servers",
            "⚠".yellow(),
            name,
            report.client
        );
    }
}
