//! Commands the cluster answers when a region calls it.
//!
//! `Identify` reports the cluster UUID. `ListBootImages` walks the TFTP tree,
//! laid out as `<arch>/<subarch>/<release>/<purpose>`. `DescribePowerTypes`
//! returns the built-in power driver catalog, JSON-encoded as a string.

use async_trait::async_trait;
use clusterlink_wire::message::commands;
use clusterlink_wire::{Identify, Responder, ResponderTable, TlsParameters};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// One boot image found under the TFTP root.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BootImage {
    pub architecture: String,
    pub subarchitecture: String,
    pub release: String,
    pub purpose: String,
}

/// Source of the boot images a cluster can serve.
#[async_trait]
pub trait ClusterInventory: Send + Sync + 'static {
    async fn boot_images(&self) -> io::Result<Vec<BootImage>>;
}

/// Boot images read from a TFTP directory tree.
#[derive(Debug, Clone)]
pub struct FilesystemInventory {
    tftp_root: PathBuf,
}

impl FilesystemInventory {
    pub fn new(tftp_root: impl Into<PathBuf>) -> Self {
        Self {
            tftp_root: tftp_root.into(),
        }
    }

    pub fn tftp_root(&self) -> &Path {
        &self.tftp_root
    }
}

const IMAGE_PATH_DEPTH: usize = 4;

/// Names of the subdirectories of `dir`, sorted. A missing directory is empty.
fn subdirectories(dir: &Path) -> io::Result<Vec<String>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn walk(dir: &Path, prefix: &mut Vec<String>, out: &mut Vec<BootImage>) -> io::Result<()> {
    for name in subdirectories(dir)? {
        prefix.push(name);
        if prefix.len() == IMAGE_PATH_DEPTH {
            out.push(BootImage {
                architecture: prefix[0].clone(),
                subarchitecture: prefix[1].clone(),
                release: prefix[2].clone(),
                purpose: prefix[3].clone(),
            });
        } else {
            let next = dir.join(&prefix[prefix.len() - 1]);
            walk(&next, prefix, out)?;
        }
        prefix.pop();
    }
    Ok(())
}

/// Every complete image path under `root`, sorted.
pub fn list_boot_images(root: &Path) -> io::Result<Vec<BootImage>> {
    let mut images = Vec::new();
    walk(root, &mut Vec::with_capacity(IMAGE_PATH_DEPTH), &mut images)?;
    Ok(images)
}

#[async_trait]
impl ClusterInventory for FilesystemInventory {
    async fn boot_images(&self) -> io::Result<Vec<BootImage>> {
        let root = self.tftp_root.clone();
        let images = tokio::task::spawn_blocking(move || list_boot_images(&root))
            .await
            .map_err(io::Error::other)??;
        debug!(root = %self.tftp_root.display(), count = images.len(), "Listed boot images");
        Ok(images)
    }
}

/// Answers `ListBootImages` with `{"images": [...]}`.
pub struct ListBootImages {
    inventory: Arc<dyn ClusterInventory>,
}

impl ListBootImages {
    pub fn new(inventory: Arc<dyn ClusterInventory>) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl Responder for ListBootImages {
    async fn respond(&self, _args: Value) -> Result<Value, String> {
        let images = self
            .inventory
            .boot_images()
            .await
            .map_err(|e| format!("Unable to list boot images: {e}"))?;
        Ok(json!({ "images": images }))
    }
}

/// One field a power driver needs.
#[derive(Debug, Clone, Serialize)]
pub struct PowerField {
    pub name: &'static str,
    pub label: &'static str,
    pub required: bool,
}

/// A power driver the cluster can operate.
#[derive(Debug, Clone, Serialize)]
pub struct PowerType {
    pub name: &'static str,
    pub description: &'static str,
    pub fields: Vec<PowerField>,
}

fn field(name: &'static str, label: &'static str, required: bool) -> PowerField {
    PowerField {
        name,
        label,
        required,
    }
}

/// The built-in power driver catalog.
pub fn power_types() -> Vec<PowerType> {
    vec![
        PowerType {
            name: "ipmi",
            description: "IPMI",
            fields: vec![
                field("power_address", "IP address", true),
                field("power_user", "Power user", false),
                field("power_pass", "Power password", false),
            ],
        },
        PowerType {
            name: "manual",
            description: "Manual power control",
            fields: Vec::new(),
        },
        PowerType {
            name: "virsh",
            description: "Virsh (virtual systems)",
            fields: vec![
                field("power_address", "Address", true),
                field("power_id", "Virsh VM ID", true),
                field("power_pass", "Password", false),
            ],
        },
        PowerType {
            name: "wakeonlan",
            description: "Wake-on-LAN",
            fields: vec![field("mac_address", "MAC address", true)],
        },
    ]
}

/// Answers `DescribePowerTypes` with `{"power_types": "<json>"}`; the catalog
/// travels as a JSON document inside a string.
pub struct DescribePowerTypes;

#[async_trait]
impl Responder for DescribePowerTypes {
    async fn respond(&self, _args: Value) -> Result<Value, String> {
        let encoded = serde_json::to_string(&power_types())
            .map_err(|e| format!("Unable to encode power types: {e}"))?;
        Ok(json!({ "power_types": encoded }))
    }
}

/// The full cluster-side responder table.
pub fn cluster_responders(
    cluster_uuid: &str,
    inventory: Arc<dyn ClusterInventory>,
    tls: Option<TlsParameters>,
) -> ResponderTable {
    let table = ResponderTable::new()
        .register(commands::IDENTIFY, Identify::cluster(cluster_uuid))
        .register(commands::LIST_BOOT_IMAGES, ListBootImages::new(inventory))
        .register(commands::DESCRIBE_POWER_TYPES, DescribePowerTypes);
    match tls {
        Some(params) => table.with_tls(params),
        None => table,
    }
}
