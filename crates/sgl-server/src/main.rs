#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use sgl_server::{start_server, Mode, ServerConfig, ShmServer, SoftwareBackend};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load().context("invalid configuration")?;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match config.mode {
        Mode::Shm => run_shm(config).await,
        Mode::Net => run_net(config).await,
    }
}

async fn run_shm(config: ServerConfig) -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let mut worker = {
        let stop = stop.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            let mut server = ShmServer::create(
                &config.shm_name,
                config.layout,
                SoftwareBackend::new(),
                config.gl_version,
            )
            .with_context(|| format!("failed to set up shared memory {:?}", config.shm_name))?;
            server.run(&stop)?;
            Ok(())
        })
    };

    tokio::select! {
        res = &mut worker => return res.context("shared memory server panicked")?,
        () = shutdown_signal() => tracing::info!("shutdown signal received"),
    }
    stop.store(true, Ordering::Release);
    worker.await.context("shared memory server panicked")?
}

async fn run_net(config: ServerConfig) -> anyhow::Result<()> {
    let handle = start_server(config.net(), SoftwareBackend::new)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_addr))?;
    tracing::info!("sgl-server listening on {}", handle.local_addr());

    shutdown_signal().await;
    tracing::info!("shutdown signal received");
    handle.shutdown().await;
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}
