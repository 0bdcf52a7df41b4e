//! Server configuration and command-line arguments.

use clap::Parser;
use std::path::PathBuf;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Per-connection outbox capacity; events past it are dropped
    pub outbox_capacity: usize,
    /// Persistence storage path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbox_capacity: 256,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// In-memory server on `bind_addr`.
    pub fn with_addr(bind_addr: impl Into<String>) -> Self {
        Self { bind_addr: bind_addr.into(), ..Self::default() }
    }
}

#[derive(Parser, Debug, Clone)]
#[command(name = "parley-hub", about = "Realtime hub for conversation groups")]
pub struct Cli {
    /// Interface to listen on
    #[arg(long, default_value = "127.0.0.1", env = "PARLEY_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 9090, env = "PARLEY_PORT")]
    pub port: u16,

    /// RocksDB directory; omit to keep everything in memory
    #[arg(long, env = "PARLEY_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Per-connection outbox capacity
    #[arg(long, default_value_t = 256)]
    pub outbox_capacity: usize,
}

impl Cli {
    pub fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_addr: format!("{}:{}", self.host, self.port),
            outbox_capacity: self.outbox_capacity,
            storage_path: self.data_dir,
        }
    }
}
