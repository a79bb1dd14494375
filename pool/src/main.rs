// SYNC Pool: Stratum v1 server for Bitaxe and other small miners
//
// Stratum listener on `listen`, operator API (health, metrics, stats) on `api_listen`.

use std::sync::Arc;
use sync_pool::api::{self, ApiState};
use sync_pool::config::Config;
use sync_pool::stratum::StratumServer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .init();

    println!("🚀 SYNC Pool v{}", env!("CARGO_PKG_VERSION"));
    let cfg = Config::load();
    cfg.work.validate()?;

    let server = Arc::new(StratumServer::new(cfg.clone()));

    if cfg.api_listen.is_empty() {
        tracing::info!("Pool API disabled");
    } else {
        let state = ApiState::new(Arc::clone(server.context()));
        let api_listen = cfg.api_listen.clone();
        tokio::spawn(async move {
            if let Err(e) = api::serve(&api_listen, state).await {
                tracing::error!("Pool API on {} failed: {:#}", api_listen, e);
            }
        });
    }

    let stratum = Arc::clone(&server);
    let mut stratum_task = tokio::spawn(async move { stratum.start().await });

    // Graceful shutdown (cross-platform: ctrl_c + SIGTERM on Unix)
    let shutdown_signal = async {
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = sigterm.recv() => tracing::info!("SIGTERM, shutting down"),
                        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT, shutting down"),
                    }
                }
                Err(e) => {
                    tracing::warn!("No SIGTERM handler ({}), waiting for Ctrl+C", e);
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Ctrl+C, shutting down");
        }
    };

    tokio::select! {
        _ = shutdown_signal => {
            server.shutdown();
            let _ = stratum_task.await;
        }
        result = &mut stratum_task => {
            // the listener only returns early on a bind failure
            result??;
        }
    }

    tracing::info!("🏁 SYNC Pool shut down cleanly");
    Ok(())
}
