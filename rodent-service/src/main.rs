//! Rodent Service
//!
//! Consolidated daemon providing:
//! - Auto-snapshot policy engine (scheduler + policy store)
//! - HTTP API under /autosnapshot
//! - JSON-RPC command socket

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use rodent_autosnap::prelude::*;
use rodent_http::prelude::*;
use rodent_jsonrpc::{JsonRpcServer, JsonRpcServerConfig};
use rodent_zfs::ZfsCli;

#[derive(Parser, Debug)]
#[command(name = "rodent-service")]
#[command(about = "ZFS auto-snapshot policy daemon")]
struct Args {
    /// Bind address (host:port)
    #[arg(short, long, default_value = "0.0.0.0:8400")]
    bind: String,

    /// Configuration directory (defaults to /etc/rodent, or RODENT_CONFIG_DIR)
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// JSON-RPC Unix socket path
    #[arg(long, default_value = "/var/run/rodent/jsonrpc.sock")]
    rpc_socket: String,

    /// Optional JSON-RPC TCP address (host:port)
    #[arg(long)]
    rpc_tcp: Option<String>,

    /// Disable the JSON-RPC server
    #[arg(long)]
    no_rpc: bool,

    /// Disable CORS
    #[arg(long)]
    no_cors: bool,

    /// zfs binary to drive
    #[arg(long, default_value = "zfs")]
    zfs_binary: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rodent_service=info".parse()?)
                .add_directive("rodent_autosnap=info".parse()?)
                .add_directive("rodent_http=info".parse()?)
                .add_directive("rodent_jsonrpc=info".parse()?)
                .add_directive("tower_http=debug".parse()?),
        )
        .init();

    let args = Args::parse();

    // --- 1. Policy engine ---

    let config_dir = args
        .config_dir
        .clone()
        .unwrap_or_else(rodent_core::config::config_dir);
    let store = ConfigStore::new(&config_dir);
    info!("Policy store at {}", store.path().display());

    let gateway = Arc::new(ZfsCli::with_binary(&args.zfs_binary));
    let manager = PolicyManager::new(store, gateway, Scheduler::new());
    manager.load_config().await?;
    manager.start();

    // --- 2. JSON-RPC surface ---

    if !args.no_rpc {
        let rpc_server = Arc::new(JsonRpcServer::new(JsonRpcServerConfig {
            unix_socket: Some(args.rpc_socket.clone()),
            tcp_addr: args.rpc_tcp.clone(),
        }));
        rodent_autosnap::rpc::register_handlers(&rpc_server, manager.clone()).await;
        tokio::spawn(async move {
            if let Err(e) = rpc_server.run().await {
                error!("JSON-RPC server error: {}", e);
            }
        });
    }

    // --- 3. HTTP surface ---

    let router = RouterBuilder::new()
        .nest(
            rodent_autosnap::http::ROUTE_PREFIX,
            "autosnapshot",
            rodent_autosnap::http::create_router(manager.clone()),
        )
        .build();

    let http = HttpServer::builder()
        .bind(args.bind.clone())
        .cors(!args.no_cors)
        .router(router)
        .build()?;

    tokio::spawn(async move {
        if let Err(e) = http.serve().await {
            error!("HTTP server error: {}", e);
        }
    });

    info!("rodent-service ready");

    // --- 4. Shutdown ---

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    manager.stop().await;

    Ok(())
}
