//! `clusterlink run`: serve the cluster's commands and keep channels open.

use anyhow::Context;
use clusterlink_agent::{cluster_responders, ClusterClientService, CredentialStore, FilesystemInventory};
use clusterlink_types::AgentConfig;
use clusterlink_wire::{RpcServer, TlsParameters};
use std::sync::Arc;
use tracing::{info, warn};

pub fn cmd_run(config: AgentConfig) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    rt.block_on(run(config))
}

async fn run(config: AgentConfig) -> anyhow::Result<()> {
    let store = CredentialStore::from_config(&config);
    let tls = match store.read()? {
        Some(secret) => Some(TlsParameters::new(
            secret.as_bytes(),
            config.cluster_uuid.clone(),
        )?),
        None => {
            warn!(
                path = %store.path().display(),
                "No shared secret provisioned; event-loop handshakes will fail until one is set"
            );
            None
        }
    };

    let inventory = Arc::new(FilesystemInventory::new(&config.tftp_root));
    info!(tftp_root = %inventory.tftp_root().display(), "Serving boot images");
    let responders = Arc::new(cluster_responders(&config.cluster_uuid, inventory, tls));

    let server = match config.listen_addr {
        Some(addr) => {
            let (server, task) = RpcServer::start(addr, Arc::clone(&responders))
                .await
                .with_context(|| format!("Failed to listen on {addr}"))?;
            info!(addr = %server.local_addr(), "Serving cluster commands");
            Some(task)
        }
        None => None,
    };

    let service = Arc::new(
        ClusterClientService::from_config(&config, responders)
            .context("Invalid directory URL")?,
    );
    info!(
        url = %config.rpc_info_url(),
        cluster = %config.cluster_uuid,
        "Cluster agent started"
    );
    service.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down");
    service.stop().await;
    if let Some(task) = server {
        task.abort();
    }
    Ok(())
}
