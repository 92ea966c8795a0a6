//! Command-line configuration.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "repo-server")]
#[command(about = "Always-on sync peer for shared documents")]
pub struct Config {
    /// Address to bind both listeners to
    #[arg(long, default_value = "0.0.0.0", env = "REPO_HOST")]
    pub host: String,

    /// HTTP port (liveness, keys, team registration)
    #[arg(long, default_value_t = 3000, env = "REPO_PORT")]
    pub port: u16,

    /// WebSocket sync port
    #[arg(long, default_value_t = 3030, env = "REPO_SYNC_PORT")]
    pub sync_port: u16,

    /// Directory for keys, shares and documents
    #[arg(long, default_value = "./data", env = "REPO_STORAGE_DIR")]
    pub storage_dir: PathBuf,

    /// Enable verbose logging
    #[arg(long, env = "REPO_VERBOSE")]
    pub verbose: bool,
}

impl Config {
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn sync_addr(&self) -> String {
        format!("{}:{}", self.host, self.sync_port)
    }
}
