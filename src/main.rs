use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use switchboard::config::Config;
use switchboard::store::NullStore;
use switchboard::App;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::load();
    info!("starting switchboard on port {}", config.listen_port);

    let app = App::new(config, Arc::new(NullStore));

    tokio::select! {
        result = app.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            app.shutdown().await;
            Ok(())
        }
    }
}
