use anyhow::Result;
use tracing::{info, warn};

use referee::{Referee, RefereeConfig};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("referee=info".parse()?),
        )
        .init();

    dotenvy::dotenv().ok();

    let config = RefereeConfig::from_env()?;
    info!(
        "Loaded mission with {} environments and {} test categories",
        config.mission.environments.executables.len(),
        config.mission.settings.tests.len()
    );

    info!("Starting referee...");
    let referee = Referee::connect(config).await?;

    // SIGINT/SIGTERM tear the session down like a broker cancel
    let shutdown = referee.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("Termination signal received");
        shutdown.notify_one();
    });

    referee.run().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
