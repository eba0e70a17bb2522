//! Errors from the wire protocol layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: u32, max: u32 },
    #[error("Peer certificate rejected: {0}")]
    CertificateRejected(String),
    #[error("Crypto error: {0}")]
    Crypto(String),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Remote error {code}: {message}")]
    Remote { code: i32, message: String },
}
