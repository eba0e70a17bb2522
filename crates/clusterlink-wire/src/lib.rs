//! Clusterlink wire protocol.
//!
//! Box-framed request/response messages over TCP between a cluster agent and
//! the region's event-loops.
//!
//! ## Architecture
//!
//! - **WireMessage**: length-prefixed JSON envelopes, identified by command name
//! - **ResponderTable**: static map from command name to [`Responder`]
//! - **Connection**: one framed TCP stream, upgradable with `StartTLS`
//! - **Certificate / TlsParameters**: mutual trust derived from a shared secret
//! - **RpcServer**: accept loop serving a responder table

pub mod connection;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod secure;
pub mod server;

pub use connection::{Connection, FrameReader, FrameWriter};
pub use dispatch::{Identify, Responder, ResponderTable};
pub use error::WireError;
pub use message::{commands, WireMessage, WireMessageKind, WireRequest, WireResponse};
pub use secure::{Certificate, Role, TlsParameters};
pub use server::{serve_connection, RpcServer};
