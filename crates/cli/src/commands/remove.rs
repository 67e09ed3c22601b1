use super::{Context, RemoveArgs};
use colored::Colorize;
use mcp_manager_core::{Client, SyncEngine};

pub async fn run(args: RemoveArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;

    let mut removed = Vec::new();
    for name in &args.names {
        let record = ctx.store.unregister(name)?;
        println!("{} Removed {}", "✓".green(), record.name.bold());
        removed.push(record.name);
    }

    if args.sync {
        let engine = SyncEngine::new(&ctx.store, ctx.config.settings.sync_policy);
        for client in Client::ALL {
            match engine.remove_from(client, &removed) {
                Ok(keys) if keys.is_empty() => {}
                Ok(keys) => println!(
                    "  {} {}: removed {}",
                    "✓".green(),
                    client,
                    keys.join(", ")
                ),
                Err(e) => println!("  {} {}: {}", "✗".red(), client, e),
            }
        }
    }

    Ok(())
}
