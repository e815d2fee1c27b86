use log::{error, info};
use tokio::sync::broadcast;

use framecast::modules::server::StreamServer;
use framecast::ServerSettings;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let settings = ServerSettings::from_env()?;
    let config = settings.stream_config()?;
    if settings.enable_timing_logs {
        info!("Timing logs enabled");
    }

    let server = StreamServer::bind(&settings.bind_addr(), config).await?;
    info!("Listening on: {}", server.local_addr()?);

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, no longer accepting connections");
                let _ = shutdown_tx.send(());
            }
            Err(e) => {
                error!("Unable to listen for Ctrl-C: {}", e);
                // Dropping the sender would stop the server
                std::future::pending::<()>().await;
                drop(shutdown_tx);
            }
        }
    });

    server.run_with_shutdown(shutdown_rx).await?;
    Ok(())
}
