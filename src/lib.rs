//! offline-shell - A versioned offline cache for web applications.
//!
//! The [`CacheManager`] decides how each request is served: static assets
//! cache-first, pages and API calls network-first with a cached fallback,
//! and a cached site shell for navigations while offline. A
//! [`ServiceWorker`] hosts one manager version, drives it through
//! install and activate, and dispatches fetches to it.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use offline_shell::{
//!     CacheConfig, CacheManager, Clients, HttpNetwork, MemoryStorage, Request, ServiceWorker,
//! };
//!
//! # async fn example() -> offline_shell::Result<()> {
//! let origin = reqwest::Url::parse("http://127.0.0.1:8080/").unwrap();
//! let manager = CacheManager::new(
//!     CacheConfig::default(),
//!     origin,
//!     MemoryStorage::new(),
//!     HttpNetwork::default(),
//! );
//! let worker = ServiceWorker::new(manager, Arc::new(Clients::new()));
//!
//! // Pre-cache the static assets, purge old versions, take control.
//! worker.start().await?;
//!
//! // Served from the cache from now on, even without a network.
//! let res = worker.fetch(Request::get("http://127.0.0.1:8080/static/style.css")?).await?;
//! println!("{} {}", res.status, res.body.len());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod network;
#[cfg(feature = "proxy")]
pub mod proxy;
pub mod request;
pub mod response;
pub mod stats;
pub mod storage;
pub mod worker;

// Re-export main types for convenience
pub use config::{AppConfig, CacheConfig, PathConfig, ProxyConfig};
pub use error::{Error, Result};
pub use event::{ActivateEvent, ExtendableEvent, FetchEvent, InstallEvent};
pub use manager::{CacheManager, Strategy};
pub use network::{HttpNetwork, Network};
pub use request::{Request, RequestKey, RequestMode};
pub use response::Response;
pub use stats::{CacheStats, StatsSnapshot};
pub use storage::{Cache, CacheStorage, DiskStorage, MemoryStorage};
pub use worker::{Client, Clients, ServiceWorker, WorkerState};
