use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;

use picshare::cli::ServerOpts;
use picshare::config::ServerConfig;
use picshare::server::Server;
use picshare::thumbnail::NoopThumbnailer;

fn main() -> Result<()> {
    let opts = ServerOpts::parse();
    picshare::init_logging(&opts.log_level);

    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted. Shutting down picshared...");
        std::process::exit(130);
    })
    .context("Error setting Ctrl-C handler")?;

    let config = ServerConfig::from(&opts);

    println!("Starting picshare daemon:");
    println!("  Bind:     {}", config.bind);
    println!("  Storage:  {}", config.storage_dir.display());
    println!("  Metadata: {}", config.metadata_file.display());
    println!("  Max upload: {} MB", opts.max_upload_mb);

    // Security warning for 0.0.0.0 binding
    if config.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the daemon to all network interfaces");
        eprintln!("   The protocol is UNENCRYPTED and names are not verified; use on trusted networks only");
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async {
        let server = Server::bind(&config, Arc::new(NoopThumbnailer)).await?;
        server.run().await
    })
}
