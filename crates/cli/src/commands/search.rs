use super::SearchArgs;
use anyhow::Context;
use colored::Colorize;
use mcp_manager_core::RegistrySearch;

pub async fn run(args: SearchArgs) -> anyhow::Result<()> {
    println!("{}", "Searching the npm registry...".dimmed());

    let results = RegistrySearch::new()
        .search(&args.query, args.limit)
        .await
        .with_context(|| format!("Search for '{}' failed", args.query))?;

    if results.is_empty() {
        println!("No MCP servers found for '{}'", args.query);
        return Ok(());
    }

    println!();
    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. {} {}",
            i + 1,
            result.name.blue(),
            format!("v{}", result.version).dimmed()
        );
        if !result.description.is_empty() {
            println!("   {}", result.description);
        }
        println!(
            "   {}",
            format!("by {} | updated {}", result.author, result.date).dimmed()
        );
    }

    println!();
    println!(
        "Use {} to register one",
        "mcp-manager add --npx <package>".cyan()
    );
    Ok(())
}
