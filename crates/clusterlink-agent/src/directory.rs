//! Peer directory client — fetches the event-loop directory from the region.
//!
//! The region publishes `{"eventloops": {<name>: [[host, port], ...]}}` at
//! `<base url>rpc/`. One call to [`DirectorySource::fetch`] is one HTTP GET;
//! failures propagate and the poll loop turns them into a retry.

use async_trait::async_trait;
use clusterlink_types::{AgentConfig, Directory, DirectoryResponse};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors fetching the directory.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("Invalid directory URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("Directory request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Directory endpoint returned HTTP {0}")]
    Status(u16),
    #[error("Malformed directory response: {0}")]
    Body(#[from] serde_json::Error),
}

/// Anything that can produce the current directory.
#[async_trait]
pub trait DirectorySource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Directory, DirectoryError>;
}

/// Fetches the directory over HTTP.
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    url: String,
    http: reqwest::Client,
}

impl DirectoryClient {
    /// Client for the directory endpoint at `url` (already including `rpc/`).
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, DirectoryError> {
        let url = url.into();
        if let Err(e) = url::Url::parse(&url) {
            return Err(DirectoryError::InvalidUrl {
                url,
                reason: e.to_string(),
            });
        }
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { url, http })
    }

    /// Client for the endpoint derived from the configured base URL.
    pub fn from_config(config: &AgentConfig) -> Result<Self, DirectoryError> {
        Self::new(
            config.rpc_info_url(),
            Duration::from_secs(config.directory_timeout_secs),
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl DirectorySource for DirectoryClient {
    async fn fetch(&self) -> Result<Directory, DirectoryError> {
        let resp = self.http.get(&self.url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(DirectoryError::Status(status.as_u16()));
        }
        let body = resp.text().await?;
        let parsed: DirectoryResponse = serde_json::from_str(&body)?;
        debug!(
            url = %self.url,
            eventloops = parsed.eventloops.len(),
            "Fetched event-loop directory"
        );
        Ok(parsed.eventloops)
    }
}

/// A fixed directory, for tests and offline use.
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory(pub Directory);

#[async_trait]
impl DirectorySource for StaticDirectory {
    async fn fetch(&self) -> Result<Directory, DirectoryError> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clusterlink_types::Address;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and return the base URL.
    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            let _ = stream.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            let _ = stream.shutdown().await;
        });
        format!("http://{addr}/")
    }

    fn client_for(base: &str) -> DirectoryClient {
        let config = AgentConfig {
            url: base.to_string(),
            ..Default::default()
        };
        DirectoryClient::from_config(&config).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_parses_directory() {
        let base = serve_once(
            "200 OK",
            r#"{"eventloops": {"host1:pid=1001": [["1.1.1.1", 1111], ["1.1.1.2", 2222]], "host2:pid=3003": [["2.2.2.2", 5555]]}}"#,
        )
        .await;
        let client = client_for(&base);
        assert!(client.url().ends_with("/rpc/"));

        let dir = client.fetch().await.unwrap();
        assert_eq!(dir.len(), 2);
        assert_eq!(
            dir.addresses("host2:pid=3003").unwrap(),
            &[Address::new("2.2.2.2", 5555)]
        );
    }

    #[tokio::test]
    async fn test_fetch_reports_http_status() {
        let base = serve_once("500 Internal Server Error", "{}").await;
        match client_for(&base).fetch().await {
            Err(DirectoryError::Status(code)) => assert_eq!(code, 500),
            other => panic!("Expected Status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fetch_reports_malformed_body() {
        let base = serve_once("200 OK", r#"{"loops": []}"#).await;
        assert!(matches!(
            client_for(&base).fetch().await,
            Err(DirectoryError::Body(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_reports_transport_error() {
        // Bind then drop to get a port nobody listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = client_for(&format!("http://{addr}/"));
        assert!(matches!(client.fetch().await, Err(DirectoryError::Http(_))));
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(matches!(
            DirectoryClient::new("not a url", Duration::from_secs(1)),
            Err(DirectoryError::InvalidUrl { .. })
        ));
    }
}
