//! Runtime configuration shared by the daemon and its tests

use std::path::PathBuf;
use std::time::Duration;

use crate::cli::ServerOpts;
use crate::protocol::{
    CONTROL_FRAME_SLACK, DEFAULT_BIND, DEFAULT_HISTORY_CAPACITY, DEFAULT_MAX_UPLOAD_BYTES,
};

// Per-session outbound queue depth; a peer further behind than this misses broadcasts
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Limits enforced by every session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_upload_bytes: u64,
    /// How long READY may wait for its binary frame; `None` waits forever
    pub payload_timeout: Option<Duration>,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            payload_timeout: Some(Duration::from_secs(300)),
        }
    }
}

impl Limits {
    /// Largest WebSocket message the transport should accept
    pub fn max_message_size(&self) -> usize {
        usize::try_from(self.max_upload_bytes)
            .unwrap_or(usize::MAX)
            .saturating_add(CONTROL_FRAME_SLACK)
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind: String,
    pub storage_dir: PathBuf,
    pub metadata_file: PathBuf,
    pub history_capacity: usize,
    pub outbound_queue: usize,
    pub limits: Limits,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind: DEFAULT_BIND.to_string(),
            storage_dir: PathBuf::from("imagens"),
            metadata_file: PathBuf::from("metadata.json"),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            outbound_queue: OUTBOUND_QUEUE_DEPTH,
            limits: Limits::default(),
        }
    }
}

impl From<&ServerOpts> for ServerConfig {
    fn from(opts: &ServerOpts) -> Self {
        let payload_timeout = match opts.payload_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        ServerConfig {
            bind: opts.bind.clone(),
            storage_dir: opts.storage_dir.clone(),
            metadata_file: opts.metadata_file.clone(),
            history_capacity: opts.history_capacity,
            outbound_queue: OUTBOUND_QUEUE_DEPTH,
            limits: Limits {
                max_upload_bytes: opts.max_upload_mb.saturating_mul(1024 * 1024),
                payload_timeout,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults_from_cli() {
        let opts = ServerOpts::parse_from(["picshared"]);
        let cfg = ServerConfig::from(&opts);
        assert_eq!(cfg.bind, "0.0.0.0:8765");
        assert_eq!(cfg.history_capacity, 5);
        assert_eq!(cfg.limits.max_upload_bytes, 64 * 1024 * 1024);
        assert_eq!(cfg.limits.payload_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_zero_timeout_disables() {
        let opts = ServerOpts::parse_from(["picshared", "--payload-timeout-secs", "0"]);
        assert_eq!(ServerConfig::from(&opts).limits.payload_timeout, None);
    }

    #[test]
    fn test_message_size_has_slack() {
        let limits = Limits {
            max_upload_bytes: 10,
            payload_timeout: None,
        };
        assert_eq!(limits.max_message_size(), 10 + CONTROL_FRAME_SLACK);
    }
}
