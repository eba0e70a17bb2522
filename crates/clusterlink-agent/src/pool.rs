//! Channel pool — keeps one ready channel per advertised event-loop.
//!
//! [`ChannelPool::reconcile`] compares a freshly fetched directory with the
//! pool and starts or drops channels so the two agree. Channels register
//! themselves only after their handshake succeeds and deregister themselves
//! when they close, so `connections` only ever holds ready channels.
//!
//! Lock order is `pending` before `connections`.

use crate::channel::{Channel, ChannelContext, ChannelError};

use clusterlink_types::{ClusterError, Directory, EventLoopName};
use rand::seq::SliceRandom;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Errors from the pool itself.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No ready channel exists right now. Retryable: the next poll may
    /// establish one.
    #[error("No connections available.")]
    NoConnectionsAvailable,
    #[error("Channel pool is not running")]
    NotRunning,
}

impl PoolError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NoConnectionsAvailable)
    }
}

impl From<PoolError> for ClusterError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::NoConnectionsAvailable => ClusterError::NoConnectionsAvailable,
            PoolError::NotRunning => ClusterError::ShuttingDown,
        }
    }
}

/// What one reconcile pass did.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Event-loops for which a connection attempt was started.
    pub started: Vec<EventLoopName>,
    /// Event-loops whose channel or pending attempt was discarded.
    pub dropped: Vec<EventLoopName>,
    attempts: Vec<JoinHandle<()>>,
}

impl Reconciliation {
    /// Whether the pass changed nothing.
    pub fn is_noop(&self) -> bool {
        self.started.is_empty() && self.dropped.is_empty()
    }

    /// Wait for every attempt started by this pass to finish, successfully
    /// or not.
    pub async fn settled(self) {
        for attempt in self.attempts {
            let _ = attempt.await;
        }
    }
}

struct PendingAttempt {
    channel: Arc<Channel>,
    abort: AbortHandle,
}

struct PoolInner {
    connections: RwLock<HashMap<EventLoopName, Arc<Channel>>>,
    pending: Mutex<HashMap<EventLoopName, PendingAttempt>>,
    running: AtomicBool,
    context: ChannelContext,
}

/// The set of ready channels, keyed by event-loop name.
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

impl ChannelPool {
    /// A running, empty pool.
    pub fn new(context: ChannelContext) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                connections: RwLock::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                running: AtomicBool::new(true),
                context,
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Names of event-loops with a ready channel, sorted.
    pub fn connection_names(&self) -> Vec<EventLoopName> {
        let conns = self
            .inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<_> = conns.keys().cloned().collect();
        names.sort();
        names
    }

    /// The ready channel for `name`, if any.
    pub fn connection(&self, name: &str) -> Option<Arc<Channel>> {
        self.inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    /// Names with a connection attempt in flight, sorted.
    pub fn pending_names(&self) -> Vec<EventLoopName> {
        let pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<_> = pending.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of ready channels.
    pub fn len(&self) -> usize {
        self.inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pick a ready channel uniformly at random.
    pub fn get_client(&self) -> Result<Arc<Channel>, PoolError> {
        if !self.is_running() {
            return Err(PoolError::NotRunning);
        }
        let conns = self
            .inner
            .connections
            .read()
            .unwrap_or_else(|e| e.into_inner());
        let ready: Vec<&Arc<Channel>> = conns.values().filter(|c| c.is_ready()).collect();
        ready
            .choose(&mut rand::thread_rng())
            .map(|c| Arc::clone(*c))
            .ok_or(PoolError::NoConnectionsAvailable)
    }

    /// Bring the pool in line with `directory`.
    ///
    /// Names gone from the directory are dropped, whether connected or still
    /// connecting. Names new to the pool get one attempt against their first
    /// advertised address. Names present on both sides are left alone, even
    /// if their addresses changed.
    pub fn reconcile(&self, directory: &Directory) -> Reconciliation {
        let mut report = Reconciliation::default();
        if !self.is_running() {
            debug!("Pool stopped; skipping reconcile");
            return report;
        }

        let mut to_close = Vec::new();
        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let mut conns = self
                .inner
                .connections
                .write()
                .unwrap_or_else(|e| e.into_inner());

            let stale: BTreeSet<EventLoopName> = conns
                .keys()
                .chain(pending.keys())
                .filter(|name| !directory.contains(name.as_str()))
                .cloned()
                .collect();
            for name in stale {
                if let Some(channel) = conns.remove(&name) {
                    to_close.push(channel);
                }
                if let Some(attempt) = pending.remove(&name) {
                    attempt.abort.abort();
                    to_close.push(attempt.channel);
                }
                report.dropped.push(name);
            }

            for (name, addresses) in directory.iter() {
                if conns.contains_key(name) || pending.contains_key(name) {
                    continue;
                }
                let Some(address) = addresses.first() else {
                    debug!(eventloop = %name, "Event-loop advertises no addresses");
                    continue;
                };
                let channel = Channel::new(name.clone(), address.clone());
                let task = tokio::spawn(Self::run_attempt(
                    Arc::clone(&self.inner),
                    Arc::clone(&channel),
                ));
                // The attempt cannot register before we release `pending`.
                pending.insert(
                    name.clone(),
                    PendingAttempt {
                        channel,
                        abort: task.abort_handle(),
                    },
                );
                report.started.push(name.clone());
                report.attempts.push(task);
            }
        }

        for channel in to_close {
            info!(eventloop = %channel.eventloop(), "Dropping connection to departed event-loop");
            tokio::spawn(async move { channel.close().await });
        }
        if !report.is_noop() {
            debug!(
                started = ?report.started,
                dropped = ?report.dropped,
                "Reconciled channel pool"
            );
        }
        report
    }

    async fn run_attempt(inner: Arc<PoolInner>, channel: Arc<Channel>) {
        let name = channel.eventloop().clone();
        let address = channel.address().clone();

        let outcome = channel.open(&inner.context).await;

        let registered = {
            let mut pending = inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let ours = pending
                .get(&name)
                .map(|p| p.channel.id() == channel.id())
                .unwrap_or(false);
            if ours {
                pending.remove(&name);
            }
            match &outcome {
                Ok(()) if !ours => {
                    debug!(eventloop = %name, "Attempt was discarded while connecting");
                    false
                }
                Ok(()) => Self::register(&inner, &channel),
                Err(_) => false,
            }
        };

        match outcome {
            Ok(()) if registered => {
                tokio::spawn(Self::watch_channel(inner, channel));
            }
            Ok(()) => channel.close().await,
            Err(e) if e.is_connectivity() => {
                warn!("Event-loop {name} ({address}): {e}");
            }
            Err(e @ ChannelError::IdentityMismatch { .. }) => {
                warn!(eventloop = %name, %address, "{e}");
            }
            Err(e) => {
                error!(
                    eventloop = %name,
                    %address,
                    error = ?e,
                    "Failure with event-loop {name} ({address})"
                );
            }
        }
    }

    /// Called with `pending` held.
    fn register(inner: &PoolInner, channel: &Arc<Channel>) -> bool {
        let name = channel.eventloop();
        if !inner.running.load(Ordering::SeqCst) {
            warn!(
                eventloop = %name,
                "Cannot register new event-loop connection: pool is not running"
            );
            return false;
        }
        let mut conns = inner.connections.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = conns.get(name) {
            warn!(
                eventloop = %name,
                existing = existing.id(),
                "Cannot register new event-loop connection: a connection is already registered"
            );
            return false;
        }
        conns.insert(name.clone(), Arc::clone(channel));
        info!(eventloop = %name, address = %channel.address(), "Registered event-loop connection");
        true
    }

    async fn watch_channel(inner: Arc<PoolInner>, channel: Arc<Channel>) {
        channel.closed().await;
        let mut conns = inner.connections.write().unwrap_or_else(|e| e.into_inner());
        let ours = conns
            .get(channel.eventloop())
            .map(|c| c.id() == channel.id())
            .unwrap_or(false);
        if ours {
            conns.remove(channel.eventloop());
            info!(eventloop = %channel.eventloop(), "Deregistered event-loop connection");
        }
    }

    /// Stop accepting registrations and close every channel and attempt.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let mut channels = Vec::new();
        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(|e| e.into_inner());
            let mut conns = self
                .inner
                .connections
                .write()
                .unwrap_or_else(|e| e.into_inner());
            for (_, attempt) in pending.drain() {
                attempt.abort.abort();
                channels.push(attempt.channel);
            }
            channels.extend(conns.drain().map(|(_, c)| c));
        }
        info!(count = channels.len(), "Stopping channel pool");
        for channel in channels {
            channel.close().await;
        }
    }
}
