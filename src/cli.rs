//! Shared CLI helpers and small reusable Clap fragments

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Options for the picshared daemon
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Picshare daemon - shared image catalog over WebSockets")]
pub struct ServerOpts {
    /// Bind address (host:port)
    #[arg(long, env = "PICSHARE_BIND", default_value = "0.0.0.0:8765")]
    pub bind: String,

    /// Directory holding uploaded files and thumbnails
    #[arg(long, env = "PICSHARE_STORAGE_DIR", default_value = "imagens")]
    pub storage_dir: PathBuf,

    /// JSON file with upload metadata
    #[arg(long, env = "PICSHARE_METADATA_FILE", default_value = "metadata.json")]
    pub metadata_file: PathBuf,

    /// Largest accepted upload in MB
    #[arg(long, env = "PICSHARE_MAX_UPLOAD_MB", default_value_t = 64)]
    pub max_upload_mb: u64,

    /// Seconds to wait for file data after READY (0 = no limit)
    #[arg(long, env = "PICSHARE_PAYLOAD_TIMEOUT_SECS", default_value_t = 300)]
    pub payload_timeout_secs: u64,

    /// Notifications replayed to clients on AUTH
    #[arg(long, env = "PICSHARE_HISTORY", default_value_t = 5)]
    pub history_capacity: usize,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Options for the picshare client
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Picshare client - upload, list and fetch shared images")]
pub struct ClientOpts {
    /// Server URL
    #[arg(long, env = "PICSHARE_SERVER", default_value = "ws://127.0.0.1:8765")]
    pub server: String,

    /// Name announced with AUTH
    #[arg(short, long, env = "PICSHARE_USER", default_value = "anon")]
    pub user: String,

    /// Log level when RUST_LOG is unset
    #[arg(long, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: ClientCommand,
}

#[derive(Clone, Debug, Subcommand)]
pub enum ClientCommand {
    /// List the shared catalog
    List,
    /// Upload a local file
    Upload { path: PathBuf },
    /// Fetch a file into a directory
    Download {
        name: String,
        #[arg(long, default_value = "downloads")]
        out: PathBuf,
    },
    /// Fetch a file for viewing
    View {
        name: String,
        #[arg(long, default_value = "downloads")]
        out: PathBuf,
    },
    /// Print upload notifications until interrupted
    Watch,
}
