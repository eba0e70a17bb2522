//! A framed TCP connection, optionally upgraded with `StartTLS`.
//!
//! Before the upgrade each frame body is plaintext JSON. The upgrade is
//! layered directly on the open socket: after the empty `StartTLS` response
//! both sides write a hello frame carrying their [`Certificate`], read the
//! peer's, and from then on every frame body is sealed.

use crate::error::WireError;
use crate::message::*;
use crate::secure::{establish, Certificate, OpeningKey, Role, SealingKey, TlsParameters};

use serde_json::Value;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::debug;

/// Read half of a connection.
pub struct FrameReader {
    half: OwnedReadHalf,
    opener: Option<OpeningKey>,
}

impl FrameReader {
    /// Read one frame body, decrypting it if the transport is secured.
    pub async fn read_frame(&mut self) -> Result<Vec<u8>, WireError> {
        let mut header = [0u8; 4];
        match self.half.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WireError::ConnectionClosed);
            }
            Err(e) => return Err(WireError::Io(e)),
        }

        let len = decode_length(&header);
        if len > MAX_MESSAGE_SIZE {
            return Err(WireError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let mut body = vec![0u8; len as usize];
        self.half.read_exact(&mut body).await?;

        match self.opener.as_mut() {
            Some(opener) => opener.open(&body),
            None => Ok(body),
        }
    }

    /// Read one framed message.
    pub async fn read_message(&mut self) -> Result<WireMessage, WireError> {
        let body = self.read_frame().await?;
        Ok(decode_message(&body)?)
    }

    pub fn is_secure(&self) -> bool {
        self.opener.is_some()
    }
}

/// Write half of a connection.
pub struct FrameWriter {
    half: OwnedWriteHalf,
    sealer: Option<SealingKey>,
}

impl FrameWriter {
    /// Write one frame body, sealing it if the transport is secured.
    pub async fn write_frame(&mut self, body: &[u8]) -> Result<(), WireError> {
        let bytes = match self.sealer.as_mut() {
            Some(sealer) => encode_frame(&sealer.seal(body)?),
            None => encode_frame(body),
        };
        self.half.write_all(&bytes).await?;
        self.half.flush().await?;
        Ok(())
    }

    /// Write one framed message.
    pub async fn write_message(&mut self, msg: &WireMessage) -> Result<(), WireError> {
        let json = serde_json::to_vec(msg)?;
        self.write_frame(&json).await
    }

    /// Close our side of the stream.
    pub async fn shutdown(&mut self) -> Result<(), WireError> {
        self.half.shutdown().await?;
        Ok(())
    }

    pub fn is_secure(&self) -> bool {
        self.sealer.is_some()
    }
}

/// One framed connection, used sequentially until it is split.
pub struct Connection {
    reader: FrameReader,
    writer: FrameWriter,
    peer_addr: SocketAddr,
    peer_certificate: Option<Certificate>,
}

impl Connection {
    /// Wrap an established TCP stream.
    pub fn new(stream: TcpStream) -> Result<Self, WireError> {
        let peer_addr = stream.peer_addr()?;
        let (read, write) = stream.into_split();
        Ok(Self {
            reader: FrameReader {
                half: read,
                opener: None,
            },
            writer: FrameWriter {
                half: write,
                sealer: None,
            },
            peer_addr,
            peer_certificate: None,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether `StartTLS` has completed on this connection.
    pub fn is_secure(&self) -> bool {
        self.reader.is_secure()
    }

    /// The certificate the peer presented during the upgrade.
    pub fn peer_certificate(&self) -> Option<&Certificate> {
        self.peer_certificate.as_ref()
    }

    pub async fn read_message(&mut self) -> Result<WireMessage, WireError> {
        self.reader.read_message().await
    }

    pub async fn write_message(&mut self, msg: &WireMessage) -> Result<(), WireError> {
        self.writer.write_message(msg).await
    }

    /// Issue one command and wait for its response.
    ///
    /// Only valid while nothing else reads from the connection (before it is
    /// split); a request arriving from the peer in the meantime is a protocol
    /// violation.
    pub async fn call(&mut self, command: &str, args: Value) -> Result<Value, WireError> {
        let request = WireMessage::request(command, args);
        self.write_message(&request).await?;

        loop {
            let msg = self.read_message().await?;
            match msg.kind {
                WireMessageKind::Response(_) if msg.id != request.id => {
                    debug!(id = %msg.id, "Discarding response to an unknown request");
                }
                WireMessageKind::Response(WireResponse::Ok { body }) => return Ok(body),
                WireMessageKind::Response(WireResponse::Error { code, message }) => {
                    return Err(WireError::Remote { code, message });
                }
                WireMessageKind::Request(req) => {
                    return Err(WireError::Protocol(format!(
                        "peer sent {} while {} was outstanding",
                        req.command, command
                    )));
                }
            }
        }
    }

    /// Client side of the upgrade: send `StartTLS`, then swap certificates.
    ///
    /// Returns the verified peer certificate.
    pub async fn request_start_tls(
        &mut self,
        params: &TlsParameters,
    ) -> Result<Certificate, WireError> {
        if self.is_secure() {
            return Err(WireError::Protocol("transport already secured".into()));
        }
        self.call(commands::START_TLS, empty_body()).await?;
        self.start_tls(Role::Client, params).await
    }

    /// Swap hello frames and install the session keys.
    ///
    /// The server calls this right after writing its empty `StartTLS`
    /// response; the client right after reading it.
    pub async fn start_tls(
        &mut self,
        role: Role,
        params: &TlsParameters,
    ) -> Result<Certificate, WireError> {
        let local = params.issue_certificate();
        self.writer.write_frame(&serde_json::to_vec(&local)?).await?;

        let body = self.reader.read_frame().await?;
        let peer: Certificate = serde_json::from_slice(&body)
            .map_err(|e| WireError::HandshakeFailed(format!("malformed peer certificate: {e}")))?;

        let (sealer, opener) = establish(params, role, &local, &peer)?;
        self.writer.sealer = Some(sealer);
        self.reader.opener = Some(opener);
        self.peer_certificate = Some(peer.clone());
        Ok(peer)
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        (self.reader, self.writer)
    }

    /// Close the connection.
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (
            Connection::new(client.unwrap()).unwrap(),
            Connection::new(accepted.unwrap().0).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_call_returns_response_body() {
        let (mut client, mut server) = pair().await;
        let server_task = tokio::spawn(async move {
            let msg = server.read_message().await.unwrap();
            server
                .write_message(&WireMessage::response(
                    &msg.id,
                    WireResponse::Ok {
                        body: json!({"name": "eloop-A"}),
                    },
                ))
                .await
                .unwrap();
        });
        let body = client.call(commands::IDENTIFY, empty_body()).await.unwrap();
        assert_eq!(body["name"], "eloop-A");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_call_surfaces_remote_error() {
        let (mut client, mut server) = pair().await;
        tokio::spawn(async move {
            let msg = server.read_message().await.unwrap();
            server
                .write_message(&WireMessage::response(
                    &msg.id,
                    WireResponse::error(ERR_UNHANDLED_COMMAND, "Unhandled command"),
                ))
                .await
                .unwrap();
        });
        match client.call("Bogus", empty_body()).await {
            Err(WireError::Remote { code, .. }) => assert_eq!(code, ERR_UNHANDLED_COMMAND),
            other => panic!("Expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_tls_encrypts_subsequent_frames() {
        let (mut client, mut server) = pair().await;
        let client_params = TlsParameters::new(b"secret", "cluster").unwrap();
        let server_params = TlsParameters::new(b"secret", "region").unwrap();

        let server_task = tokio::spawn(async move {
            let msg = server.read_message().await.unwrap();
            server
                .write_message(&WireMessage::response(&msg.id, WireResponse::empty()))
                .await
                .unwrap();
            let peer = server.start_tls(Role::Server, &server_params).await.unwrap();
            assert_eq!(peer.subject, "cluster");
            // The next frame arrives sealed and still decodes.
            let msg = server.read_message().await.unwrap();
            server
                .write_message(&WireMessage::response(
                    &msg.id,
                    WireResponse::Ok {
                        body: json!({"name": "region"}),
                    },
                ))
                .await
                .unwrap();
        });

        let peer = client.request_start_tls(&client_params).await.unwrap();
        assert_eq!(peer.subject, "region");
        assert!(client.is_secure());
        let body = client.call(commands::IDENTIFY, empty_body()).await.unwrap();
        assert_eq!(body["name"], "region");
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_start_tls_with_mismatched_secret_fails() {
        let (mut client, mut server) = pair().await;
        let client_params = TlsParameters::new(b"secret-one", "cluster").unwrap();
        let server_params = TlsParameters::new(b"secret-two", "region").unwrap();

        tokio::spawn(async move {
            let msg = server.read_message().await.unwrap();
            server
                .write_message(&WireMessage::response(&msg.id, WireResponse::empty()))
                .await
                .unwrap();
            let _ = server.start_tls(Role::Server, &server_params).await;
        });

        let result = client.request_start_tls(&client_params).await;
        assert!(matches!(result, Err(WireError::CertificateRejected(_))));
        assert!(!client.is_secure());
    }

    #[tokio::test]
    async fn test_read_after_peer_close_reports_closed() {
        let (mut client, server) = pair().await;
        server.close().await;
        assert!(matches!(
            client.read_message().await,
            Err(WireError::ConnectionClosed)
        ));
    }
}
