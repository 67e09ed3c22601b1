pub mod add;
pub mod completions;
pub mod list;
pub mod log_relay;
pub mod logs;
pub mod paths;
pub mod remove;
pub mod search;
pub mod start;
pub mod status;
pub mod stop;
pub mod sync;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use mcp_manager_core::{Config, ConfigStore, ManagerOptions, ProcessManager, SyncPolicy};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mcp-manager")]
#[command(author, version, about = "Manage MCP servers and keep MCP clients in sync.", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Register a server (or replace an existing one)
    Add(AddArgs),

    /// Unregister servers
    Remove(RemoveArgs),

    /// List registered servers
    List(ListArgs),

    /// Start one or more servers
    Start(StartArgs),

    /// Stop running servers
    Stop(StopArgs),

    /// Show status of registered servers
    Status(StatusArgs),

    /// Write the registry into client config files
    Sync(SyncArgs),

    /// Search the npm registry for MCP server packages
    Search(SearchArgs),

    /// Show a server's log
    Logs(LogsArgs),

    /// Show where the registry, client configs and logs live
    Paths,

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },

    /// Run a server, relaying its timestamped output into a log file
    #[command(hide = true)]
    LogRelay(LogRelayArgs),
}

#[derive(Parser)]
pub struct AddArgs {
    /// Server name (derived from the package name with --npx)
    pub name: Option<String>,

    /// Run an npm package through npx
    #[arg(long, conflicts_with = "socket")]
    pub npx: Option<String>,

    /// Connect to a server listening on HOST:PORT
    #[arg(long, value_name = "HOST:PORT")]
    pub socket: Option<String>,

    /// Environment variable for the server (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Sync all clients afterwards
    #[arg(long)]
    pub sync: bool,

    /// Command and arguments (everything after --)
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[derive(Parser)]
pub struct RemoveArgs {
    /// Servers to remove
    #[arg(required = true)]
    pub names: Vec<String>,

    /// Also remove the servers from every client config
    #[arg(long)]
    pub sync: bool,
}

#[derive(Parser)]
pub struct ListArgs {
    /// Merge in the servers configured in this client (cursor, claude-desktop, vscode)
    #[arg(short, long)]
    pub client: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct StartArgs {
    /// Servers to start. If not specified, reads from mcp-manager.yaml
    pub servers: Vec<String>,

    /// Leave servers running in the background and return immediately
    #[arg(short, long)]
    pub detach: bool,

    /// Wait until a server prints this text before reporting it started
    #[arg(long)]
    pub ready_pattern: Option<String>,
}

#[derive(Parser)]
pub struct StopArgs {
    /// Servers to stop (empty = all)
    pub servers: Vec<String>,
}

#[derive(Parser)]
pub struct StatusArgs {
    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser)]
pub struct SyncArgs {
    /// Clients to sync (empty = all)
    pub targets: Vec<String>,

    /// Keep (merge) or drop (overwrite) client entries not in the registry
    #[arg(short, long)]
    pub policy: Option<SyncPolicy>,
}

#[derive(Parser)]
pub struct SearchArgs {
    /// Package name or keyword
    pub query: String,

    /// Maximum number of results
    #[arg(short = 'n', long, default_value_t = 20)]
    pub limit: usize,
}

#[derive(Parser)]
pub struct LogsArgs {
    /// Server name
    pub name: String,

    /// Number of lines to show
    #[arg(short = 'n', long, default_value_t = 50)]
    pub lines: usize,
}

#[derive(Parser)]
pub struct LogRelayArgs {
    /// Log file to append to
    #[arg(long)]
    pub log: PathBuf,

    /// Program and arguments (everything after --)
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

/// Configuration plus the registry store every command works from.
pub struct Context {
    pub config: Config,
    pub store: ConfigStore,
}

impl Context {
    pub fn load() -> anyhow::Result<Self> {
        let config = Config::load().context("Failed to load configuration")?;
        let store = ConfigStore::new(config.paths.clone(), config.settings.cache_ttl());
        Ok(Self { config, store })
    }

    pub fn process_manager(&self, options: ManagerOptions) -> anyhow::Result<ProcessManager> {
        ProcessManager::load(&self.config.paths, options)
            .context("Failed to load process state")
    }

    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions::from_settings(&self.config.settings)
    }
}
