//! pontoon daemon entry point.

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pontoon::config::Config;
use pontoon::db::Database;
use pontoon::server::Server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => Config::load(&path).map_err(|err| {
            error!(path = %path, error = %err, "failed to load config");
            err
        })?,
        None => Config::default(),
    };

    info!(
        hostname = %config.hostname,
        listen = %config.listen,
        "starting pontoon"
    );

    let db = Database::open(&config.database).await?;
    let listen_addr = config.listen;
    let server = Server::new(config, db);
    server.start().await?;

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(addr = %listen_addr, "listening");
    server.listen(listener);

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    server.shutdown().await;

    Ok(())
}
