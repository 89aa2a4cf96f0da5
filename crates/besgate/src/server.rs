use std::net::SocketAddr;

use anyhow::{Context, Result};

use besgate_service::config::Config;

use crate::endpoints;
use crate::service::GatewayService;

/// Starts the gateway and the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see
    // restarts even if service creation fails.
    metric!(counter("server.starting") += 1);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("besgate-web")
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let service =
            GatewayService::create(config.clone()).context("failed to create gateway state")?;
        let socket = config.bind().parse::<SocketAddr>()?;
        let server = axum_server::bind(socket)
            .serve(endpoints::create_app(service.clone()).into_make_service());
        tracing::info!("Starting HTTP server on {}", socket);

        tokio::select! {
            result = server => result.context("HTTP server failed")?,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                service.shutdown().await;
            }
        }
        Ok::<_, anyhow::Error>(())
    })?;

    tracing::info!("System shutdown complete");
    Ok(())
}
