use anyhow::Result;
use tracing::debug;
use ws_worker::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let _log_guard = ws_logging::init_subscriber();

    let config = Config::from_env();
    debug!(
        db_path = %config.db_path.display(),
        broker = config.redis_url.is_some(),
        "Configuration loaded"
    );

    ws_worker::cli::run(config).await
}
