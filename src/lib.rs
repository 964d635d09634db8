//! Picshare library
//!
//! Shared image catalog served over WebSockets: authenticate, upload, list,
//! download or view, and get notified when someone else uploads.

pub mod broadcast;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod framing;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod thumbnail;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the fmt subscriber. `RUST_LOG` wins over `default_level`.
pub fn init_logging(default_level: &str) {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
