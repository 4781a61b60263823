//! LeafLine Stratum Mining Client - Main Application

use leafline::{
    coordinator,
    logging::init_logging,
    status::LogIndicator,
    Config, Result, SystemClock, APP_NAME, APP_VERSION,
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().await?;

    if config.print_config {
        println!("{}", config.summary()?);
        return Ok(());
    }

    let _log_guard = init_logging(config.log_level, config.log_format, config.log_file.as_deref())?;

    info!("Starting {} v{}", APP_NAME, APP_VERSION);
    info!(
        pool = %format!("{}:{}", config.pool_host.as_deref().unwrap_or_default(), config.pool_port),
        mode = %config.mode,
        workers = config.worker_count(),
        submit_mode = ?config.submit_mode,
        "Configuration loaded"
    );

    let coordinator = coordinator::from_config(
        &config,
        Arc::new(SystemClock::new()),
        Arc::new(LogIndicator),
    );
    coordinator.supervise().await?;

    info!("Shut down cleanly");
    Ok(())
}
