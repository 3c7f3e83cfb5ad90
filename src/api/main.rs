use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;

#[path = "../api/mod.rs"]
mod api;
#[path = "../controller/mod.rs"]
mod controller;
#[path = "../shared/mod.rs"]
mod shared;

#[derive(Parser)]
#[command(name = "ailab-api")]
#[command(about = "AI Lab - GPU development environment manager")]
struct Args {
    /// Path to the JSON config file
    #[arg(long, env = "AILAB_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, config_path) = shared::LabConfig::load(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let _guards = shared::logging::init_service_logging(Path::new(&config.log_dir), "ailab_api")?;
    match config_path {
        Some(path) => tracing::info!("Loaded config from {}", path.display()),
        None => tracing::info!("No config file found, using defaults"),
    }

    api::rest::api::run_rest_server(config).await
}
