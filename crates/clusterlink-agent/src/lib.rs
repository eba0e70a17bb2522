//! Cluster agent — keeps authenticated RPC channels open to every event-loop
//! the region advertises.
//!
//! The pieces, bottom-up:
//! - [`security`]: the shared secret on disk, under a file lock
//! - [`directory`]: fetches the event-loop directory over HTTP
//! - [`channel`]: one connection, secured with `StartTLS` and verified with `Identify`
//! - [`pool`]: one ready channel per event-loop, reconciled against the directory
//! - [`service`]: the poll loop driving the pool
//! - [`responders`]: commands the cluster answers for the region

pub mod channel;
pub mod config;
pub mod directory;
pub mod pool;
pub mod responders;
pub mod security;
pub mod service;

pub use channel::{Channel, ChannelContext, ChannelError, ChannelState};
pub use config::load_config;
pub use directory::{DirectoryClient, DirectoryError, DirectorySource, StaticDirectory};
pub use pool::{ChannelPool, PoolError, Reconciliation};
pub use responders::{cluster_responders, ClusterInventory, FilesystemInventory};
pub use security::{CredentialError, CredentialStore, SharedSecret};
pub use service::ClusterClientService;
