//! `hv-dispatcher` — fleet-wide global dispatcher binary (spec §1).
//! Serves the REST surface and runs the periodic node-status refresh
//! loop.

use clap::Parser;
use hvsched::config::DispatcherConfig;
use hvsched::dispatcher::GlobalDispatcher;
use std::net::SocketAddr;

#[derive(Parser, Debug)]
#[command(name = "hv-dispatcher", version, about = "Fleet-wide VM placement dispatcher")]
struct Args;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();
    let _args = Args::parse();
    let config = DispatcherConfig::from_env()?;
    log::info!("hv-dispatcher tracking {} node(s)", config.node_urls.len());

    let dispatcher = GlobalDispatcher::new(
        config.node_urls.clone(),
        config.iteration_delay,
        config.connect_timeout,
        config.read_timeout,
    );

    let addr: SocketAddr = format!("{}:{}", config.bind_url, config.bind_port).parse()?;
    let router = dispatcher.router();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("hv-dispatcher listening on {addr}");

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let refresh_loop = tokio::spawn(async move {
        dispatcher.run_refresh(shutdown_rx).await;
    });

    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(true);
    });
    server.await?;
    refresh_loop.await?;
    Ok(())
}
