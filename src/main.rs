// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::{net::SocketAddr, sync::Arc};

use identity_drive_server::{
    api::router,
    config::Config,
    state::AppState,
    telemetry::init_tracing,
    tenant::TenantRegistry,
    transit::poller::OutboxPoller,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    init_tracing(config.log_format);

    std::fs::create_dir_all(&config.data_dir)?;
    let tenants = Arc::new(TenantRegistry::open(&config)?);
    for tenant in tenants.iter() {
        tenant.ensure_owner_client()?;
    }
    tracing::info!(
        tenants = tenants.len(),
        data_dir = %config.data_dir.display(),
        "tenants opened"
    );

    let shutdown = CancellationToken::new();
    let poller = OutboxPoller::new(tenants.clone(), config.outbox_poll_interval);
    let poller_task = tokio::spawn(poller.run(shutdown.clone()));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let app = router(AppState::new(tenants, config));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "server listening (docs at /docs)");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown.cancel();
    if let Err(e) = poller_task.await {
        tracing::warn!(error = %e, "outbox poller did not stop cleanly");
    }
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received terminate signal"),
    }
    tracing::info!("shutting down gracefully");
}
