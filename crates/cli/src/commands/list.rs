use super::{Context, ListArgs};
use colored::Colorize;
use mcp_manager_core::{Client, ServerRecord, ServerSource};

pub async fn run(args: ListArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;

    let servers = match &args.client {
        Some(client) => {
            let client: Client = client.parse()?;
            ctx.store.list_with_client(client)?
        }
        None => ctx.store.list()?,
    };

    if args.json {
        let entries: Vec<serde_json::Value> = servers.iter().map(to_json).collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if servers.is_empty() {
        println!("No servers registered");
        println!();
        println!(
            "Use {} to register a server",
            "mcp-manager add <name> -- <command> [args...]".cyan()
        );
        return Ok(());
    }

    println!("{}", "Registered servers:".bold());
    println!();

    for server in &servers {
        let source = match server.source {
            ServerSource::Registry => String::new(),
            ServerSource::Client => format!(" [{}]", "client only".yellow()),
            ServerSource::Both => format!(" [{}]", "synced".green()),
        };
        println!(
            "  {} {} ({}){}",
            "●".cyan(),
            server.name.bold(),
            server.kind.label(),
            source
        );
        println!("    {}", server.launch_line().dimmed());
    }

    Ok(())
}

fn to_json(server: &ServerRecord) -> serde_json::Value {
    serde_json::json!({
        "name": server.name,
        "kind": server.kind.label(),
        "source": server.source.to_string(),
        "launch": server.launch_line(),
    })
}
