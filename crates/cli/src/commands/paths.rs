use super::Context;
use colored::Colorize;

pub async fn run() -> anyhow::Result<()> {
    let ctx = Context::load()?;
    let paths = &ctx.config.paths;

    if ctx.config.development {
        println!("{}", "Development mode: all paths are sandboxed".yellow());
        println!();
    }

    for (key, path) in paths.all() {
        let marker = if path.exists() {
            "✓".green()
        } else {
            "○".dimmed()
        };
        println!("  {} {:<16} {}", marker, key.to_string(), path.display());
    }
    println!("  {} {:<16} {}", "●".cyan(), "logs", paths.logs_dir().display());
    println!("  {} {:<16} {}", "●".cyan(), "state", paths.state_file().display());

    Ok(())
}
