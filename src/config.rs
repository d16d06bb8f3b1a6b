//! Configuration for the cache manager and the proxy host.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Assets pre-populated into the store on install.
pub const DEFAULT_STATIC_ASSETS: &[&str] = &[
    "/",
    "/static/style.css",
    "/static/logo.svg",
    "/static/apple-touch-icon.png",
    "/static/manifest.webmanifest",
];

/// Immutable policy configuration handed to the cache manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Application prefix shared by every store this manager owns.
    pub prefix: String,
    /// Current cache version. Bumping it replaces the whole cache on activate.
    pub version: String,
    /// Paths fetched and stored on install, in order.
    pub static_assets: Vec<String>,
    /// Path prefix served cache-first.
    pub static_prefix: String,
    /// Path of the site shell served to offline navigations.
    pub shell_path: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: "languagepapi".to_string(),
            version: "v1".to_string(),
            static_assets: DEFAULT_STATIC_ASSETS.iter().map(ToString::to_string).collect(),
            static_prefix: "/static/".to_string(),
            shell_path: "/".to_string(),
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the application prefix.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Sets the cache version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Replaces the install-time asset list.
    #[must_use]
    pub fn with_static_assets<I, S>(mut self, assets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.static_assets = assets.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the cache-first path prefix.
    #[must_use]
    pub fn with_static_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.static_prefix = prefix.into();
        self
    }

    /// Name of the current store: `<prefix>-<version>`.
    #[must_use]
    pub fn cache_name(&self) -> String {
        format!("{}-{}", self.prefix, self.version)
    }

    /// Returns true if `name` is a store belonging to this application.
    #[must_use]
    pub fn owns(&self, name: &str) -> bool {
        name.strip_prefix(&self.prefix)
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// Returns true if `path` falls under the cache-first namespace.
    #[must_use]
    pub fn is_static(&self, path: &str) -> bool {
        path.starts_with(&self.static_prefix)
    }
}

/// Local proxy settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Origin that requests are forwarded to.
    pub upstream: String,
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Per-request network timeout in seconds. `0` disables the timeout.
    pub timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream: "http://127.0.0.1:8080".to_string(),
            host: "127.0.0.1".to_string(),
            port: 9780,
            timeout_secs: 0,
        }
    }
}

/// Where the on-disk cache storage lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Root directory of the disk storage. Each store is a subdirectory.
    pub cache_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            cache_dir: data_dir.join("offline-shell").join("caches"),
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Cache policy configuration.
    pub cache: CacheConfig,
    /// Proxy configuration.
    pub proxy: ProxyConfig,
    /// Storage paths.
    pub paths: PathConfig,
}

impl AppConfig {
    /// Default location of the configuration file.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("offline-shell")
            .join("config.toml")
    }

    /// Loads configuration from `path`. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_toml(&contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the TOML is malformed.
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| Error::Config(e.to_string()))
    }
}
