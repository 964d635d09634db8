//! picshare - command line client for a picshare daemon

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;

use picshare::cli::{ClientCommand, ClientOpts};
use picshare::client::ShareClient;
use picshare::protocol::Event;

#[tokio::main]
async fn main() -> Result<()> {
    let opts = ClientOpts::parse();
    picshare::init_logging(&opts.log_level);

    let mut client = ShareClient::connect(&opts.server).await?;
    client.auth(&opts.user).await?;

    match opts.command {
        ClientCommand::List => {
            let entries = client.list().await?;
            println!("--- Shared files ---");
            if entries.is_empty() {
                println!("| (empty)");
            }
            for e in entries {
                println!("| {:<24} | uploader: {}", e.filename, e.uploader);
            }
        }
        ClientCommand::Upload { path } => {
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .with_context(|| format!("not a file name: {}", path.display()))?
                .to_string();
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("read {}", path.display()))?;
            println!("Uploading {} ({} bytes)...", filename, data.len());
            let id = client.upload(&filename, data).await?;
            println!("Uploaded {filename} as id {id}");
        }
        ClientCommand::Download { name, out } => {
            let data = client.download(&name).await?;
            let dest = save(&out, &name, &data).await?;
            println!("Saved {} bytes to {}", data.len(), dest.display());
        }
        ClientCommand::View { name, out } => {
            let data = client.view(&name).await?;
            let dest = save(&out, &name, &data).await?;
            println!("Saved {} bytes to {} for viewing", data.len(), dest.display());
        }
        ClientCommand::Watch => {
            println!("Watching for uploads (Ctrl-C to stop)...");
            while let Some(event) = client.next_event().await {
                print_event(&event);
            }
            return Ok(());
        }
    }

    // Anything replayed on AUTH while the command ran
    while let Some(event) = client.try_next_event() {
        print_event(&event);
    }
    client.disconnect().await?;
    Ok(())
}

async fn save(dir: &Path, name: &str, data: &[u8]) -> Result<std::path::PathBuf> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("create {}", dir.display()))?;
    // Server-side names are validated, but never trust them as paths here either
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("download");
    let dest = dir.join(format!("downloaded_{base}"));
    tokio::fs::write(&dest, data)
        .await
        .with_context(|| format!("write {}", dest.display()))?;
    Ok(dest)
}

fn print_event(event: &Event) {
    match event {
        Event::NewUpload { message, .. } => println!("[NEW UPLOAD] {message}"),
        Event::History { data } => {
            println!("[HISTORY] recent uploads:");
            for ev in data {
                if let Event::NewUpload { message, .. } = ev {
                    println!("   -> {message}");
                }
            }
        }
    }
}
