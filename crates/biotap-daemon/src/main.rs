use anyhow::Result;
use biotap_daemon::config::DaemonConfig;
use biotap_daemon::daemon;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let config = DaemonConfig::load()?;

    let default_level = config.general.log_level.clone();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting biotap daemon");

    if let Err(e) = daemon::run_with_config(config).await {
        error!("Daemon error: {:#}", e);
        return Err(e);
    }

    info!("biotap daemon stopped");
    Ok(())
}
