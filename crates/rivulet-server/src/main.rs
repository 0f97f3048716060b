use anyhow::{Context, Result};
use rivulet_server::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment variables
    let config = ServerConfig::load().context("Failed to load configuration")?;

    rivulet_server::init_logging(&config);

    rivulet_server::run(config).await.context("Server error")?;

    Ok(())
}
