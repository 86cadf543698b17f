use anyhow::Result;
use tracing_subscriber::EnvFilter;

use agent_cycle_scheduler::{config::Config, serve};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,agent_cycle_scheduler=debug")),
        )
        .with_current_span(true)
        .init();

    let config = Config::from_env()?;
    serve(config).await
}
