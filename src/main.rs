use live_poll::config::Config;
use live_poll::db::{MemoryStore, PollStore, SqliteStore};
use live_poll::handlers::{AppState, router};
use live_poll::lifecycle::PollManager;
use live_poll::tasks;

use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

#[tokio::main]
async fn main() {
    // Initialize logging
    dotenvy::dotenv().ok();
    env_logger::init();

    if let Err(e) = run().await {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::from_env()?;

    // Initialize store
    let store: Arc<dyn PollStore> = match &config.database_url {
        Some(url) => {
            info!("Using SQLite store at {}", url);
            Arc::new(SqliteStore::connect(url).await?)
        }
        None => {
            warn!("DATABASE_URL not set, polls will only live in memory");
            Arc::new(MemoryStore::new())
        }
    };

    let manager = PollManager::new(store);
    let (ended, rearmed) = manager.recover().await?;
    info!("Recovered store: {} overdue poll(s) ended, {} timer(s) re-armed", ended, rearmed);

    // --- Start Background Task for Ending and Purging Polls ---
    tokio::spawn(tasks::poll_ender::check_expired_polls_task(
        manager.clone(),
        config.sweep_interval,
    ));

    let address = SocketAddr::from(([0, 0, 0, 0], config.port));
    let app = router(AppState::new(manager, config));

    let listener = TcpListener::bind(address).await?;
    info!("Server running on {}", address);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
