//! `clusterlink secret`: inspect and provision the shared secret.

use anyhow::{bail, Context};
use clusterlink_agent::{CredentialStore, SharedSecret};
use clusterlink_types::AgentConfig;

pub fn cmd_show(config: &AgentConfig) -> anyhow::Result<()> {
    let store = CredentialStore::from_config(config);
    match store.read()? {
        Some(secret) => {
            println!("{}", secret.to_hex());
            Ok(())
        }
        None => bail!("No shared secret at {}", store.path().display()),
    }
}

pub fn cmd_set(config: &AgentConfig, hex: &str) -> anyhow::Result<()> {
    let secret = SharedSecret::from_hex(hex).context("Secret must be hex-encoded")?;
    if secret.as_bytes().is_empty() {
        bail!("Secret must not be empty");
    }
    let store = CredentialStore::from_config(config);
    store.write(&secret)?;
    println!("Shared secret written to {}", store.path().display());
    Ok(())
}

pub fn cmd_rotate(config: &AgentConfig) -> anyhow::Result<()> {
    let store = CredentialStore::from_config(config);
    let secret = store.rotate()?;
    println!("{}", secret.to_hex());
    Ok(())
}
