use super::{AddArgs, Context};
use colored::Colorize;
use mcp_manager_core::server::package_short_name;
use mcp_manager_core::{ServerRecord, SyncEngine};

pub async fn run(args: AddArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let mut record = build_record(&args)?;

    for pair in &args.env {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid environment variable '{}', expected KEY=VALUE", pair))?;
        record = record.with_env(key, value);
    }

    let name = record.name.clone();
    let launch = record.launch_line();
    let replaced = ctx.store.register(record)?;

    let verb = if replaced { "Updated" } else { "Added" };
    println!("{} {} {} ({})", "✓".green(), verb, name.bold(), launch.dimmed());

    if args.sync {
        let engine = SyncEngine::new(&ctx.store, ctx.config.settings.sync_policy);
        super::sync::sync_all(&engine)?;
    } else {
        println!(
            "\nUse {} to write it into your MCP clients",
            "mcp-manager sync".cyan()
        );
    }

    Ok(())
}

fn build_record(args: &AddArgs) -> anyhow::Result<ServerRecord> {
    if let Some(package) = &args.npx {
        let name = args
            .name
            .clone()
            .unwrap_or_else(|| package_short_name(package));
        let mut npx_args = vec!["-y".to_string(), package.clone()];
        npx_args.extend(args.command.iter().cloned());
        return Ok(ServerRecord::command(&name, "npx", npx_args));
    }

    let name = args.name.as_deref().ok_or_else(|| {
        anyhow::anyhow!("A server name is required (e.g. 'mcp-manager add files -- npx -y @modelcontextprotocol/server-filesystem /tmp')")
    })?;

    if let Some(address) = &args.socket {
        if !args.command.is_empty() {
            anyhow::bail!("--socket servers take no command");
        }
        let (host, port) = address
            .rsplit_once(':')
            .ok_or_else(|| anyhow::anyhow!("Invalid socket address '{}', expected HOST:PORT", address))?;
        let port: u16 = port
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid port '{}' in '{}'", port, address))?;
        return Ok(ServerRecord::socket(name, host, port));
    }

    let (command, rest) = args
        .command
        .split_first()
        .ok_or_else(|| anyhow::anyhow!("No command given. Pass it after '--', or use --npx or --socket"))?;
    Ok(ServerRecord::command(name, command.clone(), rest.iter().cloned()))
}
