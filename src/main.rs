use std::path::PathBuf;

use pulsecore::config::NodeConfig;
use pulsecore::supervisor::Supervisor;

fn init_logging(config: &NodeConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        pulsecore::config::LogFormat::Json => subscriber.json().init(),
        pulsecore::config::LogFormat::Pretty => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = NodeConfig::load(config_path.as_deref())?;
    init_logging(&config);

    tracing::info!(node_id = %config.node_id, region = %config.region, "starting pulsecore node");

    let supervisor = Supervisor::new(config)?;
    supervisor.start();

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }

    supervisor.shutdown().await;
    Ok(())
}
