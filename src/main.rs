use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use catapult::{
    config::Config,
    hosts::HostsSection,
    k8s::K8sClient,
    net::SystemAliaser,
    Catapult,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Catapult");

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;
    tracing::info!(
        scope = %config.scope,
        namespaces = ?config.namespaces,
        selector = %config.selector,
        hosts_file = %config.hosts_file.display(),
        "Configuration loaded"
    );

    let k8s = K8sClient::new(config.kube_context.as_deref())
        .await
        .context("Failed to connect to Kubernetes. Check your kubeconfig.")?;
    k8s.health_check()
        .await
        .context("Kubernetes cluster is not reachable")?;

    let hosts = HostsSection::new(&config.hosts_file, &config.section);
    let mut catapult = Catapult::new(
        Arc::new(k8s),
        Arc::new(SystemAliaser::new()),
        hosts,
        config.catapult_options(),
    );

    // Ctrl+C cancels the loop; cleanup happens inside `start`
    let token = CancellationToken::new();
    let shutdown = token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
        }
        tracing::info!("Shutting down...");
        shutdown.cancel();
    });

    catapult
        .start(token)
        .await
        .context("Catapult did not shut down cleanly")?;

    Ok(())
}
