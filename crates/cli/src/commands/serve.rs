//! Serve command handler.

use clap::Args;
use kbqa_core::{config::AppConfig, AppResult};
use kbqa_knowledge::Services;

/// Run the HTTP service until interrupted
#[derive(Args, Debug)]
pub struct ServeCommand {
    /// Listen address, overriding `server.listen`
    #[arg(long)]
    pub listen: Option<String>,
}

impl ServeCommand {
    pub async fn execute(&self, config: &AppConfig) -> AppResult<()> {
        let listen = self
            .listen
            .clone()
            .unwrap_or_else(|| config.server.listen.clone());
        tracing::info!(listen = %listen, "Starting service");

        let services = Services::connect(config).await?;
        kbqa_server::serve(config, services, &listen, shutdown_signal()).await
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}
