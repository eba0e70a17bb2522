//! Responder table — static mapping from command name to handler.
//!
//! A table is built once at startup by chaining [`ResponderTable::register`]
//! calls and then shared behind an `Arc`. New commands are added by
//! registering another entry; nothing is subclassed.

use crate::message::*;
use crate::secure::TlsParameters;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Handler for one command.
#[async_trait]
pub trait Responder: Send + Sync + 'static {
    /// Produce the response body for `args`, or an error message.
    async fn respond(&self, args: Value) -> Result<Value, String>;
}

/// Answers `Identify` with a fixed identity under a fixed key.
#[derive(Debug, Clone)]
pub struct Identify {
    field: &'static str,
    ident: String,
}

impl Identify {
    /// Region-side form: `{"name": <event-loop name>}`.
    pub fn eventloop(name: impl Into<String>) -> Self {
        Self {
            field: "name",
            ident: name.into(),
        }
    }

    /// Cluster-side form: `{"uuid": <cluster uuid>}`.
    pub fn cluster(uuid: impl Into<String>) -> Self {
        Self {
            field: "uuid",
            ident: uuid.into(),
        }
    }
}

#[async_trait]
impl Responder for Identify {
    async fn respond(&self, _args: Value) -> Result<Value, String> {
        let mut body = serde_json::Map::new();
        body.insert(self.field.to_string(), Value::String(self.ident.clone()));
        Ok(Value::Object(body))
    }
}

/// The set of commands one side of a connection answers.
#[derive(Default)]
pub struct ResponderTable {
    handlers: HashMap<&'static str, Arc<dyn Responder>>,
    tls: Option<TlsParameters>,
}

impl ResponderTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `responder` for `command`, replacing any earlier entry.
    pub fn register(mut self, command: &'static str, responder: impl Responder) -> Self {
        self.handlers.insert(command, Arc::new(responder));
        self
    }

    /// Answer `StartTLS` using `params`.
    pub fn with_tls(mut self, params: TlsParameters) -> Self {
        self.tls = Some(params);
        self
    }

    /// Look up the handler for `command`.
    ///
    /// `StartTLS` is handled by the transport, not by a [`Responder`]; use
    /// [`handles`](Self::handles) to ask whether it is answered.
    pub fn locate(&self, command: &str) -> Option<Arc<dyn Responder>> {
        self.handlers.get(command).cloned()
    }

    /// Whether this table answers `command` at all.
    pub fn handles(&self, command: &str) -> bool {
        if command == commands::START_TLS {
            return self.tls.is_some();
        }
        self.handlers.contains_key(command)
    }

    /// Parameters for answering `StartTLS`, if configured.
    pub fn tls_parameters(&self) -> Option<&TlsParameters> {
        self.tls.as_ref()
    }

    /// Registered command names, sorted.
    pub fn commands(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        if self.tls.is_some() {
            names.push(commands::START_TLS);
        }
        names.sort_unstable();
        names
    }

    /// Run the handler for `request` and build the response.
    pub async fn dispatch(&self, request: &WireRequest) -> WireResponse {
        let Some(responder) = self.locate(&request.command) else {
            debug!(command = %request.command, "No responder registered");
            return WireResponse::error(
                ERR_UNHANDLED_COMMAND,
                format!("Unhandled command: {}", request.command),
            );
        };
        match responder.respond(request.args.clone()).await {
            Ok(body) => WireResponse::Ok { body },
            Err(e) => {
                error!(command = %request.command, error = %e, "Responder failed");
                WireResponse::error(ERR_INTERNAL, e)
            }
        }
    }
}
