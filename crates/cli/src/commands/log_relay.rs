use super::LogRelayArgs;
use anyhow::Context;
use mcp_manager_core::process::relay_to_log;
use std::path::Path;
use tokio::signal::unix::{signal, SignalKind};

/// Helper behind `start --detach`. It shares the server's process group, so
/// a stop's SIGTERM reaches the server directly; the relay ignores it and
/// keeps logging until the server has exited.
pub async fn run(args: LogRelayArgs) -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("Failed to handle SIGTERM")?;
    tokio::spawn(async move { while terminate.recv().await.is_some() {} });

    let (program, rest) = args
        .command
        .split_first()
        .context("No command given to relay")?;
    relay_to_log(&args.log, Path::new(program), rest)
        .await
        .with_context(|| format!("Relay for {} failed", program))?;
    Ok(())
}
