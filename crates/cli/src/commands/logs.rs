use super::{Context, LogsArgs};
use colored::Colorize;
use mcp_manager_core::logs;
use mcp_manager_core::server::normalize_name;

pub async fn run(args: LogsArgs) -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let name = normalize_name(&args.name);
    let path = logs::log_path(&ctx.config.paths.logs_dir(), &name);

    let lines = logs::tail(&path, args.lines)?;
    if lines.is_empty() {
        println!("No logs for {}", name.bold());
        return Ok(());
    }

    println!("{}", path.display().to_string().dimmed());
    for line in lines {
        if line.contains("[ERROR]") || line.contains("[FATAL]") {
            println!("{}", line.red());
        } else if line.contains("[EXIT]") {
            println!("{}", line.yellow());
        } else {
            println!("{}", line);
        }
    }
    Ok(())
}
