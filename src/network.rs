//! Network abstraction.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;

/// Something that can turn a request into a response over the network.
///
/// Non-2xx statuses are responses, not errors; only transport failures are.
#[async_trait]
pub trait Network: Send + Sync + 'static {
    /// Performs a single attempt for `request`.
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

#[async_trait]
impl<N: Network> Network for std::sync::Arc<N> {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        self.as_ref().fetch(request).await
    }
}

/// Network backend built on `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
}

impl Default for HttpNetwork {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

impl HttpNetwork {
    /// Wraps an existing client.
    #[must_use]
    pub const fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// Builds a client with an optional per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn with_timeout(timeout: Option<Duration>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30));
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self::new(builder.build()?))
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let res = builder.send().await?;
        let status = res.status();
        let headers = res
            .headers()
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
        let body = res.bytes().await?;

        log::debug!("{} {} -> {}", request.method, request.url, status.as_u16());
        Ok(Response {
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("").to_string(),
            headers,
            body,
        })
    }
}

/// Resolves a path from the asset list against `base`.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] if the join fails.
pub fn resolve(base: &Url, path: &str) -> Result<Url> {
    base.join(path)
        .map_err(|e| Error::InvalidUrl(format!("{path} against {base}: {e}")))
}
