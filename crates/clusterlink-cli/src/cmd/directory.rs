//! `clusterlink directory`: one-off fetch of the event-loop directory.

use anyhow::Context;
use clusterlink_agent::{DirectoryClient, DirectorySource};
use clusterlink_types::{AgentConfig, DirectoryResponse};

pub fn cmd_directory(config: &AgentConfig, json: bool) -> anyhow::Result<()> {
    let client = DirectoryClient::from_config(config)?;
    let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let eventloops = rt
        .block_on(client.fetch())
        .with_context(|| format!("Failed to fetch {}", client.url()))?;

    if json {
        let body = DirectoryResponse { eventloops };
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    if eventloops.is_empty() {
        println!("No event-loops advertised at {}", client.url());
        return Ok(());
    }
    for (name, addresses) in eventloops.iter() {
        let joined: Vec<String> = addresses.iter().map(|a| a.to_string()).collect();
        println!("{:<40} {}", name.as_str(), joined.join(", "));
    }
    Ok(())
}
