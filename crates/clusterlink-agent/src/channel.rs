//! Channel — one authenticated connection to one event-loop.
//!
//! A channel walks `Connecting → Handshaking → Ready → Closed`. Any failure
//! goes straight to `Closed`, which is terminal. The handshake is two
//! sequential calls on the fresh socket: `StartTLS` (with certificates
//! derived from the shared secret) and then `Identify`, whose answer must
//! match the event-loop name the channel was created for.
//!
//! Once ready, a background task owns the read half: it routes responses to
//! waiting callers and serves the region's own requests from the cluster's
//! responder table.

use crate::security::{CredentialError, CredentialStore};

use chrono::{DateTime, Utc};
use clusterlink_types::{Address, EventLoopName};
use clusterlink_wire::message::{commands, empty_body, ERR_BAD_REQUEST};
use clusterlink_wire::{
    Certificate, Connection, FrameReader, FrameWriter, ResponderTable, TlsParameters, WireError,
    WireMessage, WireMessageKind, WireResponse,
};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// TCP connect outstanding.
    Connecting,
    /// `StartTLS` and `Identify` in progress.
    Handshaking,
    /// Verified and usable for RPCs.
    Ready,
    /// Terminal.
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Ready => "ready",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Errors from opening or using a channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("{0}")]
    Connect(std::io::Error),
    #[error("Connection attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("The remote event-loop identifies itself as {actual}, but {expected} was expected.")]
    IdentityMismatch {
        expected: EventLoopName,
        actual: String,
    },
    #[error("Malformed Identify response: {0}")]
    MalformedIdentity(String),
    #[error("No shared secret has been provisioned")]
    MissingSecret,
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
    #[error("Channel to {0} is not ready")]
    NotReady(EventLoopName),
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },
    #[error("Channel closed")]
    Closed,
}

impl ChannelError {
    /// Expected network conditions: refused, unreachable, timed out.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect(_) | Self::Timeout(_))
    }
}

/// What every channel needs to complete its handshake.
#[derive(Clone)]
pub struct ChannelContext {
    /// Source of the shared secret, read fresh for every handshake.
    pub credentials: CredentialStore,
    /// Subject of our certificates (the cluster UUID).
    pub subject: String,
    /// Commands the region may call on us over a ready channel.
    pub responders: Arc<ResponderTable>,
    /// Limit on the TCP connect.
    pub connect_timeout: Duration,
}

/// An authenticated connection to one event-loop.
pub struct Channel {
    id: u64,
    eventloop: EventLoopName,
    address: Address,
    created_at: DateTime<Utc>,
    state: watch::Sender<ChannelState>,
    writer: tokio::sync::Mutex<Option<FrameWriter>>,
    pending: Mutex<HashMap<String, oneshot::Sender<WireResponse>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    peer_certificate: Mutex<Option<Certificate>>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("eventloop", &self.eventloop)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    /// A new channel in `Connecting`, not yet attempted.
    pub fn new(eventloop: EventLoopName, address: Address) -> Arc<Self> {
        let (state, _) = watch::channel(ChannelState::Connecting);
        Arc::new(Self {
            id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            eventloop,
            address,
            created_at: Utc::now(),
            state,
            writer: tokio::sync::Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            reader: Mutex::new(None),
            peer_certificate: Mutex::new(None),
        })
    }

    /// Process-unique identifier, distinguishing reconnects to one event-loop.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn eventloop(&self) -> &EventLoopName {
        &self.eventloop
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ChannelState::Ready
    }

    /// The certificate the event-loop presented, once secured.
    pub fn peer_certificate(&self) -> Option<Certificate> {
        self.peer_certificate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    /// Resolve once the channel reaches `Closed`.
    pub async fn closed(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
    }

    /// Move to `next` unless already closed. Returns false if closed.
    fn transition(&self, next: ChannelState) -> bool {
        let mut moved = false;
        self.state.send_if_modified(|current| {
            if *current == ChannelState::Closed || *current == next {
                return false;
            }
            debug!(
                eventloop = %self.eventloop,
                from = %current,
                to = %next,
                "Channel state change"
            );
            *current = next;
            moved = true;
            true
        });
        moved
    }

    /// Mark closed and fail every outstanding call.
    fn mark_closed(&self) {
        self.transition(ChannelState::Closed);
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Connect and run the handshake. On success the channel is `Ready`;
    /// on any failure it is `Closed` and the socket has been dropped.
    pub async fn open(self: &Arc<Self>, ctx: &ChannelContext) -> Result<(), ChannelError> {
        let result = self.drive(ctx).await;
        if result.is_err() {
            self.mark_closed();
        }
        result
    }

    async fn drive(self: &Arc<Self>, ctx: &ChannelContext) -> Result<(), ChannelError> {
        debug!(eventloop = %self.eventloop, address = %self.address, "Connecting to event-loop");
        let connect = TcpStream::connect((self.address.host.as_str(), self.address.port));
        let stream = match tokio::time::timeout(ctx.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ChannelError::Connect(e)),
            Err(_) => return Err(ChannelError::Timeout(ctx.connect_timeout)),
        };
        let mut conn = Connection::new(stream)?;

        if !self.transition(ChannelState::Handshaking) {
            return Err(ChannelError::Closed);
        }
        self.secure(&mut conn, ctx).await?;
        self.identify(&mut conn).await?;

        let (reader, writer) = conn.into_split();
        *self.writer.lock().await = Some(writer);
        if !self.transition(ChannelState::Ready) {
            self.writer.lock().await.take();
            return Err(ChannelError::Closed);
        }

        let task = tokio::spawn(Arc::clone(self).read_loop(reader, Arc::clone(&ctx.responders)));
        *self.reader.lock().unwrap_or_else(|e| e.into_inner()) = Some(task);
        info!(eventloop = %self.eventloop, address = %self.address, "Channel ready");
        Ok(())
    }

    async fn secure(&self, conn: &mut Connection, ctx: &ChannelContext) -> Result<(), ChannelError> {
        let store = ctx.credentials.clone();
        let secret = tokio::task::spawn_blocking(move || store.read())
            .await
            .map_err(|e| ChannelError::Wire(WireError::HandshakeFailed(e.to_string())))??
            .ok_or(ChannelError::MissingSecret)?;
        let params = TlsParameters::new(secret.as_bytes(), ctx.subject.clone())?;

        let peer = conn.request_start_tls(&params).await?;
        let local = params.subject();
        info!(
            eventloop = %self.eventloop,
            "Host certificate: subject={local}\n---\nPeer certificate: {peer}"
        );
        *self
            .peer_certificate
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(peer);
        Ok(())
    }

    async fn identify(&self, conn: &mut Connection) -> Result<(), ChannelError> {
        let body = conn.call(commands::IDENTIFY, empty_body()).await?;
        let actual = body
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::MalformedIdentity(body.to_string()))?;
        if actual != self.eventloop.as_str() {
            return Err(ChannelError::IdentityMismatch {
                expected: self.eventloop.clone(),
                actual: actual.to_string(),
            });
        }
        Ok(())
    }

    /// Issue one command and wait for its response body.
    pub async fn call(&self, command: &str, args: Value) -> Result<Value, ChannelError> {
        if !self.is_ready() {
            return Err(ChannelError::NotReady(self.eventloop.clone()));
        }

        let msg = WireMessage::request(command, args);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(msg.id.clone(), tx);
        // Closing clears `pending` after flipping the state, so re-check.
        if !self.is_ready() {
            self.forget(&msg.id);
            return Err(ChannelError::Closed);
        }

        {
            let mut writer = self.writer.lock().await;
            let Some(writer) = writer.as_mut() else {
                self.forget(&msg.id);
                return Err(ChannelError::Closed);
            };
            if let Err(e) = writer.write_message(&msg).await {
                self.forget(&msg.id);
                return Err(e.into());
            }
        }

        match rx.await {
            Ok(WireResponse::Ok { body }) => Ok(body),
            Ok(WireResponse::Error { code, message }) => Err(ChannelError::Remote { code, message }),
            Err(_) => Err(ChannelError::Closed),
        }
    }

    fn forget(&self, id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }

    async fn send(&self, msg: &WireMessage) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(w) => Ok(w.write_message(msg).await?),
            None => Err(ChannelError::Closed),
        }
    }

    async fn read_loop(self: Arc<Self>, mut reader: FrameReader, responders: Arc<ResponderTable>) {
        let reason = loop {
            let WireMessage { id, kind } = match reader.read_message().await {
                Ok(m) => m,
                Err(e) => break e,
            };
            match kind {
                WireMessageKind::Response(resp) => {
                    let waiter = self
                        .pending
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(resp);
                        }
                        None => warn!(
                            eventloop = %self.eventloop,
                            %id,
                            "Response to unknown request"
                        ),
                    }
                }
                WireMessageKind::Request(req) => {
                    let channel = Arc::clone(&self);
                    let responders = Arc::clone(&responders);
                    tokio::spawn(async move {
                        let resp = if req.command == commands::START_TLS {
                            WireResponse::error(ERR_BAD_REQUEST, "Transport already secured")
                        } else {
                            responders.dispatch(&req).await
                        };
                        if let Err(e) = channel.send(&WireMessage::response(&id, resp)).await {
                            debug!(
                                eventloop = %channel.eventloop,
                                command = %req.command,
                                error = %e,
                                "Could not deliver response"
                            );
                        }
                    });
                }
            }
        };

        match reason {
            WireError::ConnectionClosed => {
                info!(eventloop = %self.eventloop, "Event-loop closed the connection")
            }
            e => warn!(eventloop = %self.eventloop, error = %e, "Lost connection to event-loop"),
        }
        self.mark_closed();
        // Detach rather than abort: this is the reader task itself.
        self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }

    /// Close the transport and move to `Closed`. Idempotent.
    pub async fn close(&self) {
        self.mark_closed();
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = reader {
            task.abort();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
    }
}
