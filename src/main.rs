use std::sync::Arc;

use dotenv::dotenv;
use log::{error, info};
use messenger::config::Config;
use messenger::server::Server;
use messenger::storage::Engine;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let config = Config::from_env()?;
    let engine = Engine::open(&config.database, &config.schema, config.statement_timeout)?;
    let server = Server::new(Arc::new(engine));

    // Start server in a separate task
    let server_addr = config.server_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = server.run(&server_addr).await {
            error!("Server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down server...");

    Ok(())
}
