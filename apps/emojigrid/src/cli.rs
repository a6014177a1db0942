use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use emojigrid_client::config::Config;
use emojigrid_client::telemetry::logging::{LogConfig, LogLevel};
use emojigrid_client::transport::websocket::WebSocketConfig;
use emojigrid_client::transport::websocket::config::DEFAULT_PATH;

#[derive(Parser, Debug)]
#[command(
    name = "emojigrid",
    about = "🟨  Watch and claim cells on the shared 1000x1000 emoji grid",
    author,
    version
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "EMOJIGRID_ENDPOINT",
        value_name = "URL",
        help = "WebSocket endpoint of the grid server (ws://host:port/ws)"
    )]
    pub endpoint: Option<String>,

    #[arg(
        long,
        global = true,
        env = "EMOJIGRID_CATALOG",
        value_name = "PATH",
        help = "Emoji catalog JSON"
    )]
    pub catalog: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "EMOJIGRID_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        global = true,
        value_name = "PATH",
        env = "EMOJIGRID_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print a window of the grid whenever it changes
    Watch(WatchArgs),
    /// Claim one empty cell
    Place(PlaceArgs),
    /// Search the emoji catalog by tag
    Search(SearchArgs),
}

#[derive(Args, Debug, Clone)]
pub struct WatchArgs {
    #[arg(long, default_value_t = 0, help = "Top row of the window")]
    pub row: usize,
    #[arg(long, default_value_t = 0, help = "Left column of the window")]
    pub col: usize,
    #[arg(long, default_value_t = 20, help = "Window height in cells")]
    pub rows: usize,
    #[arg(long, default_value_t = 40, help = "Window width in cells")]
    pub cols: usize,
}

#[derive(Args, Debug, Clone)]
pub struct PlaceArgs {
    #[arg(long)]
    pub row: usize,
    #[arg(long)]
    pub col: usize,
    #[arg(long, value_name = "ID|GLYPH|TAG", help = "Catalog id, the emoji itself, or a tag")]
    pub emoji: String,
    #[arg(
        long,
        default_value_t = 10,
        value_name = "SECS",
        help = "How long to wait for the server's verdict"
    )]
    pub wait: u64,
}

#[derive(Args, Debug, Clone)]
pub struct SearchArgs {
    /// Tag substring; empty lists every tagged entry
    #[arg(default_value = "")]
    pub query: String,
    #[arg(long, default_value_t = 20)]
    pub limit: usize,
}

impl Cli {
    /// Fold CLI overrides into the environment-derived configuration.
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(endpoint) = self.endpoint.as_deref() {
            config.endpoint = WebSocketConfig::new(endpoint)
                .with_path(DEFAULT_PATH)
                .build_url();
        }
        if let Some(catalog) = &self.catalog {
            config.catalog_path = catalog.clone();
        }
        config
    }
}
