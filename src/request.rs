//! Request identity as seen by the cache manager.

use std::fmt;

use reqwest::{Method, Url};

use crate::error::{Error, Result};

/// How the request was initiated by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level document navigation.
    Navigate,
    /// Same-origin subresource request.
    SameOrigin,
    /// Opaque subresource request (images, styles, scripts).
    #[default]
    NoCors,
    /// Cross-origin request with CORS.
    Cors,
}

/// An outgoing request intercepted from a controlled client.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL.
    pub url: Url,
    /// Request mode.
    pub mode: RequestMode,
    /// Request headers forwarded to the network.
    pub headers: Vec<(String, String)>,
    /// Request body, only forwarded for passthrough requests.
    pub body: bytes::Bytes,
}

impl Request {
    /// Creates a request with no headers and an empty body.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            mode: RequestMode::default(),
            headers: Vec::new(),
            body: bytes::Bytes::new(),
        }
    }

    /// Parses `url` and creates a `GET` request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `url` is not an absolute URL.
    pub fn get(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{url}: {e}")))?;
        Ok(Self::new(Method::GET, url))
    }

    /// Creates a navigation `GET` request for `url`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if `url` is not an absolute URL.
    pub fn navigate(url: &str) -> Result<Self> {
        Ok(Self::get(url)?.with_mode(RequestMode::Navigate))
    }

    /// Sets the request mode.
    #[must_use]
    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the request method.
    #[must_use]
    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Appends a header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<bytes::Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns true for top-level navigations.
    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// URL path component.
    #[must_use]
    pub fn path(&self) -> &str {
        self.url.path()
    }

    /// Identity used to key cache entries.
    #[must_use]
    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.method, &self.url)
    }
}

/// Cache key: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
    /// Builds a key from a method and URL. The fragment never participates.
    #[must_use]
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {url}", method.as_str()))
    }

    /// Key for `GET url`.
    #[must_use]
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    /// Raw key string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Rebuilds a key from its raw string form.
    #[must_use]
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
