//! Transport security derived from a pre-shared secret.
//!
//! Both ends of a connection hold the same shared secret, so no certificate
//! authority is needed: each side issues itself a [`Certificate`] whose
//! signature is an HMAC over its subject and a fresh nonce, and verifies the
//! peer's certificate the same way. The two certificate nonces then seed one
//! AES-256-GCM key per direction, and every frame after the upgrade is sealed
//! with a counter nonce.

use crate::error::WireError;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Nonce};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::Zeroizing;

type HmacSha256 = Hmac<Sha256>;

/// Random bytes in each certificate nonce.
pub const CERT_NONCE_LEN: usize = 16;

/// AES-GCM nonce size.
const GCM_NONCE_LEN: usize = 12;

const CERT_LABEL: &[u8] = b"clusterlink-certificate";
const CLIENT_TO_SERVER: &[u8] = b"clusterlink client-to-server";
const SERVER_TO_CLIENT: &[u8] = b"clusterlink server-to-client";

fn hmac_digest(secret: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).expect("HMAC accepts any key size");
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Which end of the connection we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the `StartTLS` request.
    Client,
    /// Answered it.
    Server,
}

/// Self-issued certificate, verifiable by anyone holding the shared secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    /// Who issued it (cluster UUID or event-loop name).
    pub subject: String,
    /// Hex-encoded random nonce, fresh per connection.
    pub nonce: String,
    /// Hex-encoded HMAC-SHA256(secret, label || subject || nonce).
    pub signature: String,
}

impl Certificate {
    /// Issue a certificate for `subject` with a fresh nonce.
    pub fn issue(secret: &[u8], subject: &str) -> Self {
        let mut nonce = [0u8; CERT_NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let nonce = hex::encode(nonce);
        let signature = hex::encode(Self::sign(secret, subject, &nonce));
        Self {
            subject: subject.to_string(),
            nonce,
            signature,
        }
    }

    fn sign(secret: &[u8], subject: &str, nonce: &str) -> [u8; 32] {
        hmac_digest(
            secret,
            &[CERT_LABEL, subject.as_bytes(), b"\0", nonce.as_bytes()],
        )
    }

    /// Verify the signature in constant time.
    pub fn verify(&self, secret: &[u8]) -> bool {
        let expected = hex::encode(Self::sign(secret, &self.subject, &self.nonce));
        subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), self.signature.as_bytes()).into()
    }

    /// Short SHA-256 fingerprint, for logs.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.subject.as_bytes());
        hasher.update(self.nonce.as_bytes());
        hasher.update(self.signature.as_bytes());
        let digest = hasher.finalize();
        digest[..8]
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":")
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject={} fingerprint={}", self.subject, self.fingerprint())
    }
}

/// Local parameters for a `StartTLS` upgrade: the secret and our certificate.
///
/// These never travel over the wire as part of the `StartTLS` box; only the
/// certificate is sent, in the hello frame that follows the empty response.
#[derive(Clone)]
pub struct TlsParameters {
    secret: Zeroizing<Vec<u8>>,
    subject: String,
}

impl TlsParameters {
    /// Build parameters from the shared secret. An empty secret is refused.
    pub fn new(secret: &[u8], subject: impl Into<String>) -> Result<Self, WireError> {
        if secret.is_empty() {
            return Err(WireError::HandshakeFailed(
                "transport security requires a non-empty shared secret".into(),
            ));
        }
        Ok(Self {
            secret: Zeroizing::new(secret.to_vec()),
            subject: subject.into(),
        })
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub(crate) fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// Issue a fresh certificate for one upgrade.
    pub fn issue_certificate(&self) -> Certificate {
        Certificate::issue(&self.secret, &self.subject)
    }
}

impl fmt::Debug for TlsParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsParameters")
            .field("subject", &self.subject)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Seals outgoing frames.
pub struct SealingKey {
    cipher: Aes256Gcm,
    counter: u64,
}

/// Opens incoming frames.
pub struct OpeningKey {
    cipher: Aes256Gcm,
    counter: u64,
}

fn counter_nonce(counter: u64) -> [u8; GCM_NONCE_LEN] {
    let mut nonce = [0u8; GCM_NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn next_counter(counter: &mut u64) -> Result<u64, WireError> {
    let current = *counter;
    *counter = current
        .checked_add(1)
        .ok_or_else(|| WireError::Crypto("frame counter exhausted".into()))?;
    Ok(current)
}

impl SealingKey {
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, WireError> {
        let nonce = counter_nonce(next_counter(&mut self.counter)?);
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| WireError::Crypto(format!("encryption failed: {e}")))
    }
}

impl OpeningKey {
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, WireError> {
        let nonce = counter_nonce(next_counter(&mut self.counter)?);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|e| WireError::Crypto(format!("decryption failed: {e}")))
    }
}

fn cipher_for(
    secret: &[u8],
    label: &[u8],
    client: &Certificate,
    server: &Certificate,
) -> Result<Aes256Gcm, WireError> {
    use aes_gcm::aead::KeyInit;

    let key = Zeroizing::new(hmac_digest(
        secret,
        &[label, client.nonce.as_bytes(), server.nonce.as_bytes()],
    ));
    Aes256Gcm::new_from_slice(&*key).map_err(|e| WireError::Crypto(format!("invalid key: {e}")))
}

/// Verify the peer certificate and derive this side's session keys.
pub fn establish(
    params: &TlsParameters,
    role: Role,
    local: &Certificate,
    peer: &Certificate,
) -> Result<(SealingKey, OpeningKey), WireError> {
    if !peer.verify(params.secret()) {
        return Err(WireError::CertificateRejected(format!(
            "signature of {} does not verify against the shared secret",
            peer.subject
        )));
    }
    if peer.nonce == local.nonce {
        return Err(WireError::CertificateRejected(
            "peer replayed our certificate nonce".into(),
        ));
    }

    let (client, server) = match role {
        Role::Client => (local, peer),
        Role::Server => (peer, local),
    };
    let c2s = cipher_for(params.secret(), CLIENT_TO_SERVER, client, server)?;
    let s2c = cipher_for(params.secret(), SERVER_TO_CLIENT, client, server)?;
    let (seal, open) = match role {
        Role::Client => (c2s, s2c),
        Role::Server => (s2c, c2s),
    };
    Ok((
        SealingKey {
            cipher: seal,
            counter: 0,
        },
        OpeningKey {
            cipher: open,
            counter: 0,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"\x00shared-secret-for-tests";

    #[test]
    fn test_certificate_verifies_with_same_secret() {
        let cert = Certificate::issue(SECRET, "cluster-1");
        assert!(cert.verify(SECRET));
        assert!(!cert.verify(b"another secret"));
    }

    #[test]
    fn test_certificate_with_long_secret_verifies() {
        // Keys longer than the SHA-256 block are hashed down first.
        let secret = vec![0x5a; 200];
        let cert = Certificate::issue(&secret, "cluster-1");
        assert_eq!(cert.signature.len(), 64);
        assert!(cert.verify(&secret));
        assert!(!cert.verify(&secret[..199]));
    }

    #[test]
    fn test_tampered_certificate_rejected() {
        let mut cert = Certificate::issue(SECRET, "cluster-1");
        cert.subject = "cluster-2".to_string();
        assert!(!cert.verify(SECRET));
    }

    #[test]
    fn test_empty_secret_refused() {
        assert!(TlsParameters::new(b"", "x").is_err());
    }

    #[test]
    fn test_session_keys_pair_up() {
        let params = TlsParameters::new(SECRET, "side").unwrap();
        let client_cert = params.issue_certificate();
        let server_cert = params.issue_certificate();

        let (mut client_seal, mut client_open) =
            establish(&params, Role::Client, &client_cert, &server_cert).unwrap();
        let (mut server_seal, mut server_open) =
            establish(&params, Role::Server, &server_cert, &client_cert).unwrap();

        let sealed = client_seal.seal(b"hello region").unwrap();
        assert_ne!(&sealed[..], b"hello region");
        assert_eq!(server_open.open(&sealed).unwrap(), b"hello region");

        let sealed = server_seal.seal(b"hello cluster").unwrap();
        assert_eq!(client_open.open(&sealed).unwrap(), b"hello cluster");
    }

    #[test]
    fn test_wrong_secret_certificate_rejected() {
        let ours = TlsParameters::new(SECRET, "cluster").unwrap();
        let theirs = TlsParameters::new(b"other", "region").unwrap();
        let local = ours.issue_certificate();
        let peer = theirs.issue_certificate();
        assert!(matches!(
            establish(&ours, Role::Client, &local, &peer),
            Err(WireError::CertificateRejected(_))
        ));
    }

    #[test]
    fn test_out_of_order_frame_fails_to_open() {
        let params = TlsParameters::new(SECRET, "side").unwrap();
        let a = params.issue_certificate();
        let b = params.issue_certificate();
        let (mut seal, _) = establish(&params, Role::Client, &a, &b).unwrap();
        let (_, mut open) = establish(&params, Role::Server, &b, &a).unwrap();
        let _first = seal.seal(b"one").unwrap();
        let second = seal.seal(b"two").unwrap();
        assert!(open.open(&second).is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let params = TlsParameters::new(SECRET, "side").unwrap();
        let shown = format!("{params:?}");
        assert!(shown.contains("redacted"));
        assert!(!shown.contains("shared-secret"));
    }
}
