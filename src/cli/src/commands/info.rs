//! `kiln info` command.

use std::path::PathBuf;

use clap::Args;
use kiln_core::config::default_cache_dir;
use kiln_runtime::{CacheFs, DockerClient};

#[derive(Args)]
pub struct InfoArgs {
    /// Cache directory to report on (default: ~/.kiln/cache)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,
}

pub async fn execute(args: InfoArgs) -> Result<(), Box<dyn std::error::Error>> {
    println!("kiln version {}", kiln_core::VERSION);

    // Container engine
    match DockerClient::connect(None) {
        Ok(client) => match client.server_version().await {
            Ok(version) => println!("Docker: {version}"),
            Err(e) => println!("Docker: not available ({e})"),
        },
        Err(e) => println!("Docker: not available ({e})"),
    }

    let cache_dir = args.cache_dir.unwrap_or_else(default_cache_dir);
    println!("Cache directory: {}", cache_dir.display());

    if cache_dir.exists() {
        match CacheFs::new(&cache_dir).and_then(|cache| cache.list_entries()) {
            Ok(entries) => println!("Cache entries: {}", entries.len()),
            Err(e) => println!("Cache entries: unreadable ({e})"),
        }
    } else {
        println!("Cache entries: 0");
    }

    Ok(())
}
