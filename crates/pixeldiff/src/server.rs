use std::net::SocketAddr;

use anyhow::{Context, Result};

use pixeldiff_service::config::Config;
use pixeldiff_service::metric;

use crate::endpoints;
use crate::service::Service;

/// Starts the service and the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("pixeldiff")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let socket = config.bind.parse::<SocketAddr>()?;

    runtime.block_on(async {
        let service = Service::create(config).context("failed to create service state")?;

        tracing::info!("Starting HTTP server on {}", socket);
        axum_server::bind(socket)
            .serve(endpoints::create_app(service).into_make_service())
            .await
            .context("failed to serve HTTP")
    })?;

    tracing::info!("System shutdown complete");

    Ok(())
}
