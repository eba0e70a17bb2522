//! Core types for the clusterlink control-plane agent.
//!
//! This crate defines the data structures shared by the wire protocol, the
//! agent and the CLI: event-loop names and addresses, the directory shape,
//! configuration, and the top-level error type. It contains no business logic.

pub mod config;
pub mod error;
pub mod eventloop;

pub use config::AgentConfig;
pub use error::{ClusterError, ClusterResult};
pub use eventloop::{Address, Directory, DirectoryResponse, EventLoopName};
