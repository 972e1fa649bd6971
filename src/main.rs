mod api;
mod bands;
mod classifier;
mod config;
mod curve;
mod decode;
mod error;
mod graph;
mod host;
mod transport;

use tracing_subscriber::EnvFilter;

use crate::api::serve;
use crate::config::resolve_config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Initializing server");
    let config = resolve_config()?;
    serve(config).await
}
