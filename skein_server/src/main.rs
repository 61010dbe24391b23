use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use skein_core::hub::Hub;
use skein_core::{ws, RegistryBuilder, SourceDescriptor};

/// Server configuration, loaded from a TOML file whose path is the first
/// command-line argument (default `skein.toml`).
///
/// ```toml
/// listen = "127.0.0.1:8080"
///
/// [datasource.tweets]
/// type = "elasticsearch"
/// url = "http://127.0.0.1:9200/tweets"
/// ```
#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_listen")]
    listen: String,
    #[serde(default, rename = "datasource")]
    datasources: HashMap<String, SourceDescriptor>,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map_or_else(|| PathBuf::from("skein.toml"), PathBuf::from);
    let raw = std::fs::read_to_string(&config_path)
        .map_err(|err| format!("cannot read {}: {err}", config_path.display()))?;
    let config: ServerConfig = toml::from_str(&raw)?;

    let registry = Arc::new(RegistryBuilder::new().build(&config.datasources)?);
    info!(sources = registry.len(), "registry configured");

    let hub = Arc::new(Hub::new(registry));
    let app = ws::router(Arc::clone(&hub));

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    info!(listen = %config.listen, "listening for websocket clients");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
