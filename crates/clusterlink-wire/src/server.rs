//! RpcServer — accept loop that serves a [`ResponderTable`].
//!
//! The cluster runs one of these so the region can reach it directly, and
//! tests run one per simulated event-loop. When the table carries TLS
//! parameters, every command other than `StartTLS` is refused until the
//! transport has been upgraded.

use crate::connection::Connection;
use crate::dispatch::ResponderTable;
use crate::error::WireError;
use crate::message::*;
use crate::secure::Role;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// A listening RPC endpoint.
pub struct RpcServer {
    local_addr: SocketAddr,
}

impl RpcServer {
    /// Bind `listen_addr` and start accepting connections.
    pub async fn start(
        listen_addr: SocketAddr,
        responders: Arc<ResponderTable>,
    ) -> Result<(Arc<Self>, JoinHandle<()>), WireError> {
        let listener = TcpListener::bind(listen_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            addr = %local_addr,
            commands = ?responders.commands(),
            "RPC server listening"
        );

        let server = Arc::new(Self { local_addr });

        let accept_handle = tokio::spawn(async move {
            Self::accept_loop(listener, responders).await;
        });

        Ok((server, accept_handle))
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_loop(listener: TcpListener, responders: Arc<ResponderTable>) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "Accepted connection");
                    let responders = Arc::clone(&responders);
                    tokio::spawn(async move {
                        let conn = match Connection::new(stream) {
                            Ok(c) => c,
                            Err(e) => {
                                debug!(%addr, error = %e, "Dropping connection");
                                return;
                            }
                        };
                        if let Err(e) = serve_connection(conn, &responders).await {
                            debug!(%addr, error = %e, "Inbound connection ended");
                        }
                    });
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}

/// Serve requests on one connection until the peer hangs up.
pub async fn serve_connection(
    mut conn: Connection,
    responders: &ResponderTable,
) -> Result<(), WireError> {
    let addr = conn.peer_addr();
    loop {
        let msg = match conn.read_message().await {
            Ok(m) => m,
            Err(WireError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };

        let request = match msg.kind {
            WireMessageKind::Request(req) => req,
            WireMessageKind::Response(_) => {
                warn!(%addr, id = %msg.id, "Unexpected response message");
                continue;
            }
        };

        if request.command == commands::START_TLS {
            let Some(params) = responders.tls_parameters() else {
                let resp = WireResponse::error(ERR_UNHANDLED_COMMAND, "StartTLS not supported");
                conn.write_message(&WireMessage::response(&msg.id, resp)).await?;
                continue;
            };
            if conn.is_secure() {
                let resp = WireResponse::error(ERR_BAD_REQUEST, "Transport already secured");
                conn.write_message(&WireMessage::response(&msg.id, resp)).await?;
                continue;
            }
            conn.write_message(&WireMessage::response(&msg.id, WireResponse::empty()))
                .await?;
            let peer = conn.start_tls(Role::Server, params).await?;
            info!(%addr, peer = %peer, "Transport secured");
            continue;
        }

        // Clients must complete StartTLS before anything else when the
        // server is configured for it.
        if responders.tls_parameters().is_some() && !conn.is_secure() {
            warn!(
                %addr,
                command = %request.command,
                "Rejected command on an unsecured transport"
            );
            let resp = WireResponse::error(
                ERR_UNAUTHENTICATED,
                "Transport security required: call StartTLS first",
            );
            conn.write_message(&WireMessage::response(&msg.id, resp)).await?;
            continue;
        }

        let resp = responders.dispatch(&request).await;
        conn.write_message(&WireMessage::response(&msg.id, resp)).await?;
    }
}
