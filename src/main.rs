use std::sync::Arc;
use tracing::info;

use snapsum::config::AppConfig;
use snapsum::database::{SqlxJobStore, ensure_schema, init_pool};
use snapsum::engine::Dispatcher;
use snapsum::logging;
use snapsum::services::{ChatCompletionGenerator, OembedMetadataFetcher};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present; real environment wins.
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env()?;
    let _guard = logging::init_logging(&config.log_dir)?;

    info!(version = env!("CARGO_PKG_VERSION"), "snapsum starting");

    let pool = init_pool(&config.database_url).await?;
    ensure_schema(&pool).await?;

    let store = Arc::new(SqlxJobStore::new(pool.clone()));
    let fetcher = Arc::new(OembedMetadataFetcher::new(&config.oembed_endpoint)?);
    let generator = Arc::new(ChatCompletionGenerator::new(
        &config.summary_endpoint,
        &config.summary_api_key,
        &config.summary_model,
    )?);

    let dispatcher = Arc::new(Dispatcher::new(
        store,
        fetcher,
        generator,
        config.engine.clone(),
    ));
    dispatcher.start().await?;

    let cleanup_token = tokio_util::sync::CancellationToken::new();
    logging::start_retention_cleanup(&config.log_dir, cleanup_token.child_token());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    cleanup_token.cancel();
    dispatcher.stop().await?;
    pool.close().await;

    info!("snapsum stopped");
    Ok(())
}
