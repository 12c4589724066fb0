use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dfs_gateway::args::Args;
use dfs_gateway::native::localfs::LocalConnector;
use dfs_gateway::registry::HandleRegistry;
use dfs_gateway::server;
use log::{LevelFilter, error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .filter_level(LevelFilter::Debug)
        .init();

    let args = Args::parse();

    if !args.root_dir.exists() {
        error!("Root directory {:?} does not exist", args.root_dir);
        std::process::exit(1);
    }

    if !args.root_dir.is_dir() {
        error!("Root directory {:?} is not a directory", args.root_dir);
        std::process::exit(1);
    }

    let root_dir = args
        .root_dir
        .canonicalize()
        .context("failed to canonicalize root directory")?;

    info!("serving root directory {:?}", root_dir);
    info!("max read size: {} bytes", args.max_read_size);

    let registry = Arc::new(HandleRegistry::new(Box::new(LocalConnector::new(root_dir))));

    let addr = format!("{}:{}", args.host, args.port)
        .parse()
        .context("invalid listen address")?;

    info!("starting the server on port {}", args.port);
    server::serve(addr, registry, args.max_read_size)
        .await
        .context("gateway server failed")?;

    Ok(())
}
