//! Authenticated HTTP(S) requests against the manager's agent endpoint.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use reqwest::{Certificate, Client, Identity, Method, RequestBuilder, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::Correlation;

/// Default client-side deadline for a long-poll GET.
pub const DEFAULT_LONG_POLL_TIMEOUT: Duration = Duration::from_secs(600);

/// Default client-side deadline for a POST.
pub const DEFAULT_POST_TIMEOUT: Duration = Duration::from_secs(60);

/// A request to the manager failed.
///
/// Deliberately opaque: connection errors and bad statuses look the same
/// to callers. Details are logged where they occur.
#[derive(Debug, Error)]
#[error("Request to {url} failed")]
pub struct TransportError {
    url: String,
}

impl TransportError {
    /// Failure of a request to `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// HTTP client construction error.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("TLS configuration error: {0}")]
    Tls(#[from] reqwest::Error),
}

/// Request/response channel to the manager.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Long-poll for inbound messages.
    ///
    /// `Ok(None)` means the request succeeded with an empty or non-JSON body.
    async fn get(&self, correlation: &Correlation) -> Result<Option<Value>, TransportError>;

    /// Send a JSON body.
    ///
    /// `Ok(None)` means the request succeeded with an empty or non-JSON body.
    async fn post(&self, body: &Value) -> Result<Option<Value>, TransportError>;
}

/// HTTP client settings.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Agent endpoint on the manager.
    pub url: String,
    /// Verify the manager's certificate.
    pub verify_tls: bool,
    /// Extra PEM root certificate.
    pub ca_file: Option<PathBuf>,
    /// PEM client certificate and private key.
    pub identity: Option<(PathBuf, PathBuf)>,
    /// Deadline for a long-poll GET.
    pub long_poll_timeout: Duration,
    /// Deadline for a POST.
    pub post_timeout: Duration,
}

impl HttpConfig {
    /// Settings for `url` with verification on and default timeouts.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            verify_tls: true,
            ca_file: None,
            identity: None,
            long_poll_timeout: DEFAULT_LONG_POLL_TIMEOUT,
            post_timeout: DEFAULT_POST_TIMEOUT,
        }
    }
}

/// [`Transport`] over reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    url: String,
    long_poll_timeout: Duration,
    post_timeout: Duration,
}

fn read(path: &Path) -> Result<Vec<u8>, SetupError> {
    std::fs::read(path).map_err(|source| SetupError::Read {
        path: path.to_path_buf(),
        source,
    })
}

impl HttpTransport {
    /// Build a client from `config`.
    ///
    /// # Errors
    /// Returns error if certificate files cannot be read or parsed.
    pub fn new(config: &HttpConfig) -> Result<Self, SetupError> {
        let mut builder = Client::builder();

        if !config.verify_tls {
            tracing::warn!(url = %config.url, "TLS verification of the manager is disabled");
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(ca_file) = &config.ca_file {
            builder = builder.add_root_certificate(Certificate::from_pem(&read(ca_file)?)?);
        }

        if let Some((cert_file, key_file)) = &config.identity {
            let mut pem = read(cert_file)?;
            pem.push(b'\n');
            pem.extend(read(key_file)?);
            builder = builder.identity(Identity::from_pem(&pem)?);
        }

        Ok(Self {
            client: builder.build()?,
            url: config.url.clone(),
            long_poll_timeout: config.long_poll_timeout,
            post_timeout: config.post_timeout,
        })
    }

    async fn execute(
        &self,
        method: Method,
        request: RequestBuilder,
        body: Option<&Value>,
    ) -> Result<Option<Value>, TransportError> {
        let response = request.send().await.map_err(|e| {
            tracing::error!(url = %self.url, error = %e, "Error connecting to manager");
            TransportError::new(&self.url)
        })?;

        let status = response.status();
        if !status.is_success() {
            tracing::error!(
                url = %self.url,
                method = %method,
                status = status.as_u16(),
                "Bad status from manager"
            );
            if status == StatusCode::PAYLOAD_TOO_LARGE {
                let payload = body
                    .and_then(|b| serde_json::to_string_pretty(b).ok())
                    .unwrap_or_default();
                tracing::error!(payload = %payload, "Oversized request");
            }
            return Err(TransportError::new(&self.url));
        }

        let text = response.text().await.map_err(|e| {
            tracing::error!(url = %self.url, error = %e, "Error reading response");
            TransportError::new(&self.url)
        })?;
        Ok(serde_json::from_str(&text).ok())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, correlation: &Correlation) -> Result<Option<Value>, TransportError> {
        let request = self
            .client
            .get(&self.url)
            .query(correlation)
            .timeout(self.long_poll_timeout);
        self.execute(Method::GET, request, None).await
    }

    async fn post(&self, body: &Value) -> Result<Option<Value>, TransportError> {
        let request = self
            .client
            .post(&self.url)
            .json(body)
            .timeout(self.post_timeout);
        self.execute(Method::POST, request, Some(body)).await
    }
}
