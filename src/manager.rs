//! The cache manager: install, activate and fetch routing policy.

use std::sync::Arc;
use std::time::Instant;

use futures::future::try_join_all;
use reqwest::{Method, Url};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::event::{ActivateEvent, ExtendableEvent, FetchEvent, InstallEvent};
use crate::network::{Network, resolve};
use crate::request::{Request, RequestKey};
use crate::response::Response;
use crate::stats::{CacheStats, Outcome};
use crate::storage::{Cache, CacheStorage};

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Not intercepted; the host does a plain network fetch.
    Passthrough,
    /// Serve from cache, fill from network on a miss.
    CacheFirst,
    /// Ask the network, fall back to the cache when it fails.
    NetworkFirst,
}

struct Inner<S, N> {
    config: CacheConfig,
    base: Url,
    storage: S,
    network: N,
    stats: CacheStats,
}

/// Versioned offline cache manager.
///
/// Cheap to clone; clones share storage, network and counters. Every
/// handler clones the manager into the futures it registers so the work
/// outlives the borrow of the event.
pub struct CacheManager<S, N> {
    inner: Arc<Inner<S, N>>,
}

impl<S, N> Clone for CacheManager<S, N> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: CacheStorage, N: Network> CacheManager<S, N> {
    /// Creates a manager. `base` is the origin the asset list and shell
    /// path are resolved against.
    #[must_use]
    pub fn new(config: CacheConfig, base: Url, storage: S, network: N) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                base,
                storage,
                network,
                stats: CacheStats::new(),
            }),
        }
    }

    /// Policy configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Underlying cache storage.
    #[must_use]
    pub fn storage(&self) -> &S {
        &self.inner.storage
    }

    /// Underlying network.
    #[must_use]
    pub fn network(&self) -> &N {
        &self.inner.network
    }

    /// Request counters.
    #[must_use]
    pub fn stats(&self) -> &CacheStats {
        &self.inner.stats
    }

    /// URL of the offline shell.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidUrl`] if the shell path does not resolve.
    pub fn shell_url(&self) -> Result<Url> {
        resolve(&self.inner.base, &self.inner.config.shell_path)
    }

    /// Picks the strategy for `request`. The static namespace wins over
    /// every other rule.
    #[must_use]
    pub fn strategy_for(&self, request: &Request) -> Strategy {
        if request.method != Method::GET {
            Strategy::Passthrough
        } else if self.inner.config.is_static(request.path()) {
            Strategy::CacheFirst
        } else {
            Strategy::NetworkFirst
        }
    }

    // ---------------------------------------------------------------------
    // Install
    // ---------------------------------------------------------------------

    /// Install handler: populates the store and asks to skip waiting.
    pub fn on_install(&self, event: &mut InstallEvent) {
        let this = self.clone();
        event.wait_until(async move { this.install().await.map(|_| ()) });
        event.skip_waiting();
    }

    /// Fetches every static asset and stores them all, or none.
    ///
    /// Returns the number of stored entries.
    ///
    /// # Errors
    ///
    /// Fails if any asset cannot be fetched, answers with a non-2xx status,
    /// or cannot be written.
    pub async fn install(&self) -> Result<usize> {
        let start = Instant::now();
        let name = self.inner.config.cache_name();

        let requests = self
            .inner
            .config
            .static_assets
            .iter()
            .map(|path| Ok(Request::new(Method::GET, resolve(&self.inner.base, path)?)))
            .collect::<Result<Vec<_>>>()?;

        let cache = self.inner.storage.open(&name).await?;
        let fetched = try_join_all(requests.iter().map(|req| self.fetch_required(req))).await?;

        let keys: Vec<RequestKey> = requests.iter().map(Request::key).collect();
        let mut previous = Vec::with_capacity(keys.len());
        for key in &keys {
            previous.push(cache.lookup(key).await?);
        }

        for (written, (key, res)) in keys.iter().zip(&fetched).enumerate() {
            if let Err(e) = cache.put(key, res).await {
                log::error!("Install of {name} failed writing {key}: {e}");
                Self::restore(&cache, &keys[..written], &previous).await;
                return Err(e);
            }
        }

        let bytes: u64 = fetched.iter().map(|r| r.body.len() as u64).sum();
        log::info!(
            "Installed {} assets into {name} ({bytes} bytes) in {:.1?}",
            keys.len(),
            start.elapsed()
        );
        Ok(keys.len())
    }

    /// Puts back what `keys` held before a failed install overwrote them.
    async fn restore(cache: &S::Cache, keys: &[RequestKey], previous: &[Option<Response>]) {
        for (key, prev) in keys.iter().zip(previous) {
            let undone = match prev {
                Some(res) => cache.put(key, res).await,
                None => cache.delete(key).await.map(|_| ()),
            };
            if let Err(e) = undone {
                log::warn!("Rollback of {key} failed: {e}");
            }
        }
    }

    /// Whether the current store already holds every static asset, i.e. a
    /// previous install of this version completed.
    ///
    /// # Errors
    ///
    /// Fails if the storage cannot be read.
    pub async fn is_installed(&self) -> Result<bool> {
        let name = self.inner.config.cache_name();
        if !self.inner.storage.has(&name).await? {
            return Ok(false);
        }
        let cache = self.inner.storage.open(&name).await?;
        for path in &self.inner.config.static_assets {
            let url = resolve(&self.inner.base, path)?;
            if cache.lookup(&RequestKey::get(&url)).await?.is_none() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn fetch_required(&self, request: &Request) -> Result<Response> {
        let res = self.inner.network.fetch(request).await.inspect_err(|e| {
            log::error!("Install fetch failed for {}: {e}", request.url);
        })?;
        if !res.is_ok() {
            log::error!("Install fetch for {} returned {}", request.url, res.status);
            return Err(Error::BadStatus {
                url: request.url.to_string(),
                status: res.status,
            });
        }
        Ok(res)
    }

    // ---------------------------------------------------------------------
    // Activate
    // ---------------------------------------------------------------------

    /// Activate handler: purges old stores and claims open clients.
    pub fn on_activate(&self, event: &mut ActivateEvent) {
        let this = self.clone();
        event.wait_until(async move { this.activate().await.map(|_| ()) });
        event.claim_clients();
    }

    /// Deletes every store of this application except the current one.
    ///
    /// Returns the names that were deleted.
    ///
    /// # Errors
    ///
    /// Fails if the storage cannot be listed or a delete fails.
    pub async fn activate(&self) -> Result<Vec<String>> {
        let current = self.inner.config.cache_name();
        let stale: Vec<String> = self
            .inner
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| self.inner.config.owns(name) && *name != current)
            .collect();

        try_join_all(stale.iter().map(|name| self.inner.storage.delete(name))).await?;

        for name in &stale {
            log::info!("Deleted stale cache {name}");
        }
        log::info!("Activated {current}");
        Ok(stale)
    }

    // ---------------------------------------------------------------------
    // Fetch
    // ---------------------------------------------------------------------

    /// Fetch handler. Leaves non-GET requests alone; everything else gets a
    /// response that never fails.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyResponded`] if another handler already
    /// answered the event.
    pub fn on_fetch(&self, event: &mut FetchEvent) -> Result<()> {
        let strategy = self.strategy_for(event.request());
        if strategy == Strategy::Passthrough {
            self.inner.stats.record(Outcome::Passthrough);
            return Ok(());
        }

        let this = self.clone();
        let request = event.request().clone();
        let lifetime = event.lifetime();
        event.respond_with(async move {
            let res = match strategy {
                Strategy::CacheFirst => this.cache_first(&request, &lifetime).await,
                _ => this.network_first(&request, &lifetime).await,
            };
            Ok(res)
        })
    }

    /// Cache-first handling for static assets.
    pub async fn cache_first(&self, request: &Request, lifetime: &ExtendableEvent) -> Response {
        let key = request.key();
        if let Some(cached) = self.lookup(&key).await {
            log::debug!("Cache hit: {key}");
            self.inner.stats.record(Outcome::CacheHit);
            return cached;
        }

        match self.inner.network.fetch(request).await {
            Ok(res) => {
                self.inner.stats.record(Outcome::Network);
                if res.is_ok() {
                    self.store_later(lifetime, key, res.clone());
                }
                res
            }
            Err(e) => {
                log::warn!("Static asset {} unavailable: {e}", request.url);
                self.inner.stats.record(Outcome::Offline);
                Response::offline()
            }
        }
    }

    /// Network-first handling for pages and API calls.
    pub async fn network_first(&self, request: &Request, lifetime: &ExtendableEvent) -> Response {
        let key = request.key();
        let err = match self.inner.network.fetch(request).await {
            Ok(res) => {
                self.inner.stats.record(Outcome::Network);
                if res.is_ok() && request.path() == self.inner.config.shell_path {
                    self.store_later(lifetime, key, res.clone());
                }
                return res;
            }
            Err(e) => e,
        };
        log::warn!("Network failed for {}: {err}", request.url);

        if let Some(cached) = self.lookup(&key).await {
            self.inner.stats.record(Outcome::FallbackExact);
            return cached;
        }

        if request.is_navigation() {
            match self.shell_url() {
                Ok(url) => {
                    if let Some(shell) = self.lookup(&RequestKey::get(&url)).await {
                        self.inner.stats.record(Outcome::FallbackShell);
                        return shell;
                    }
                }
                Err(e) => log::warn!("{e}"),
            }
        }

        self.inner.stats.record(Outcome::Offline);
        Response::offline()
    }

    /// Looks `key` up in every store of this application, current first.
    /// Storage errors count as a miss.
    async fn lookup(&self, key: &RequestKey) -> Option<Response> {
        match self.try_lookup(key).await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Cache lookup for {key} failed: {e}");
                None
            }
        }
    }

    async fn try_lookup(&self, key: &RequestKey) -> Result<Option<Response>> {
        let current = self.inner.config.cache_name();
        if let Some(res) = self.lookup_in(&current, key).await? {
            return Ok(Some(res));
        }

        let older = self.inner.storage.keys().await?;
        for name in older.iter().filter(|n| self.inner.config.owns(n) && **n != current) {
            if let Some(res) = self.lookup_in(name, key).await? {
                return Ok(Some(res));
            }
        }
        Ok(None)
    }

    async fn lookup_in(&self, name: &str, key: &RequestKey) -> Result<Option<Response>> {
        // Avoid recreating a store that activation just removed.
        if !self.inner.storage.has(name).await? {
            return Ok(None);
        }
        self.inner.storage.open(name).await?.lookup(key).await
    }

    /// Writes `response` into the current store without delaying the
    /// caller. Failures are logged and dropped.
    fn store_later(&self, lifetime: &ExtendableEvent, key: RequestKey, response: Response) {
        let this = self.clone();
        lifetime.wait_until(async move {
            match this.store(&key, &response).await {
                Ok(()) => {
                    log::debug!("Cached {key}");
                    this.inner.stats.record(Outcome::Stored);
                }
                Err(e) => {
                    log::warn!("Failed to cache {key}: {e}");
                    this.inner.stats.record(Outcome::WriteFailure);
                }
            }
            Ok(())
        });
    }

    async fn store(&self, key: &RequestKey, response: &Response) -> Result<()> {
        let cache = self
            .inner
            .storage
            .open(&self.inner.config.cache_name())
            .await?;
        cache.put(key, response).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::{MemoryCache, MemoryStorage};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    pub const BASE: &str = "https://app.test/";

    /// Network that serves canned responses by path and counts calls.
    #[derive(Default)]
    pub struct MockNetwork {
        routes: Mutex<HashMap<String, Response>>,
        calls: Mutex<Vec<String>>,
        offline: AtomicBool,
    }

    impl MockNetwork {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn route(self, path: &str, res: Response) -> Self {
            self.routes.lock().unwrap().insert(path.to_string(), res);
            self
        }

        pub fn set_route(&self, path: &str, res: Response) {
            self.routes.lock().unwrap().insert(path.to_string(), res);
        }

        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        pub fn calls_to(&self, path: &str) -> usize {
            self.calls.lock().unwrap().iter().filter(|p| *p == path).count()
        }

        pub fn total_calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Network for MockNetwork {
        async fn fetch(&self, request: &Request) -> Result<Response> {
            let path = request.path().to_string();
            self.calls.lock().unwrap().push(path.clone());
            if self.offline.load(Ordering::SeqCst) {
                return Err(Error::Network("offline".to_string()));
            }
            let found = self.routes.lock().unwrap().get(&path).cloned();
            Ok(found.unwrap_or_else(|| Response::new(404, "not found")))
        }
    }

    pub fn online_network() -> Arc<MockNetwork> {
        Arc::new(
            MockNetwork::new()
                .route("/", Response::new(200, "<html>shell</html>"))
                .route("/static/style.css", Response::new(200, "body{}"))
                .route("/static/logo.svg", Response::new(200, "<svg/>"))
                .route("/static/apple-touch-icon.png", Response::new(200, vec![137u8, 80, 78, 71]))
                .route("/static/manifest.webmanifest", Response::new(200, "{}"))
                .route("/api/progress", Response::new(200, "{\"xp\":10}")),
        )
    }

    pub fn manager_with(
        config: CacheConfig,
        network: Arc<MockNetwork>,
    ) -> CacheManager<MemoryStorage, Arc<MockNetwork>> {
        CacheManager::new(config, Url::parse(BASE).unwrap(), MemoryStorage::new(), network)
    }

    fn url(path: &str) -> String {
        format!("https://app.test{path}")
    }

    fn key(path: &str) -> RequestKey {
        RequestKey::from_raw(format!("GET {}", url(path)))
    }

    async fn current_cache(m: &CacheManager<MemoryStorage, Arc<MockNetwork>>) -> MemoryCache {
        m.storage().open(&m.config().cache_name()).await.unwrap()
    }

    /// Dispatches a fetch event the way the host does and waits for the
    /// event's background work. `None` means the request was not intercepted.
    async fn dispatch<S: CacheStorage, N: Network>(
        m: &CacheManager<S, N>,
        request: Request,
    ) -> Option<Response> {
        let mut event = FetchEvent::new(request);
        m.on_fetch(&mut event).unwrap();
        let (_, lifetime, response) = event.into_parts();
        let res = match response {
            Some(fut) => Some(fut.await.unwrap()),
            None => None,
        };
        lifetime.settled().await.unwrap();
        res
    }

    // =========================================================================
    // Routing
    // =========================================================================

    #[test]
    fn strategy_routing() {
        let m = manager_with(CacheConfig::default(), online_network());
        let get = |p: &str| Request::get(&url(p)).unwrap();

        assert_eq!(m.strategy_for(&get("/static/style.css")), Strategy::CacheFirst);
        assert_eq!(m.strategy_for(&get("/")), Strategy::NetworkFirst);
        assert_eq!(m.strategy_for(&get("/api/progress")), Strategy::NetworkFirst);
        assert_eq!(
            m.strategy_for(&get("/static/x.css").with_method(Method::POST)),
            Strategy::Passthrough
        );
        assert_eq!(
            m.strategy_for(&get("/static/x.css").with_method(Method::HEAD)),
            Strategy::Passthrough
        );
    }

    #[test]
    fn static_namespace_takes_precedence_over_shell() {
        let config = CacheConfig::default()
            .with_static_prefix("/")
            .with_static_assets(["/"]);
        let m = manager_with(config, online_network());
        let req = Request::navigate(&url("/")).unwrap();
        assert_eq!(m.strategy_for(&req), Strategy::CacheFirst);
    }

    mod property_tests {
        use super::{manager_with, online_network, url};
        use crate::config::CacheConfig;
        use crate::manager::Strategy as Route;
        use crate::request::Request;
        use proptest::prelude::*;
        use reqwest::Method;

        fn method() -> impl Strategy<Value = Method> {
            prop_oneof![
                Just(Method::POST),
                Just(Method::PUT),
                Just(Method::PATCH),
                Just(Method::DELETE),
                Just(Method::HEAD),
                Just(Method::OPTIONS),
            ]
        }

        proptest! {
            #[test]
            fn non_get_is_never_intercepted(m in method(), path in "/[a-z/]{0,20}") {
                let manager = manager_with(CacheConfig::default(), online_network());
                let req = Request::get(&url(&path)).unwrap().with_method(m);
                prop_assert_eq!(manager.strategy_for(&req), Route::Passthrough);
            }

            #[test]
            fn static_paths_are_cache_first(rest in "[a-z0-9._-]{0,30}") {
                let manager = manager_with(CacheConfig::default(), online_network());
                let req = Request::get(&url(&format!("/static/{rest}"))).unwrap();
                prop_assert_eq!(manager.strategy_for(&req), Route::CacheFirst);
            }
        }
    }

    // =========================================================================
    // Install
    // =========================================================================

    #[tokio::test]
    async fn install_two_assets() {
        let config = CacheConfig::default().with_static_assets(["/", "/static/style.css"]);
        let m = manager_with(config, online_network());

        let mut event = InstallEvent::new();
        m.on_install(&mut event);
        let (lifetime, skip) = event.into_parts();
        lifetime.settled().await.unwrap();

        assert!(skip);
        let cache = current_cache(&m).await;
        assert_eq!(cache.len().unwrap(), 2);
        assert!(cache.lookup(&key("/")).await.unwrap().is_some());
        assert!(cache.lookup(&key("/static/style.css")).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn install_default_manifest() {
        let m = manager_with(CacheConfig::default(), online_network());
        assert_eq!(m.install().await.unwrap(), 5);
        assert_eq!(
            m.storage().keys().await.unwrap(),
            vec!["languagepapi-v1".to_string()]
        );
    }

    #[tokio::test]
    async fn install_is_all_or_nothing_on_fetch_error() {
        let network = online_network();
        let config = CacheConfig::default().with_static_assets(["/", "/static/missing.css"]);
        let m = manager_with(config, Arc::clone(&network));

        let err = m.install().await.unwrap_err();
        assert!(matches!(err, Error::BadStatus { status: 404, .. }));
        assert!(current_cache(&m).await.is_empty().unwrap());
    }

    #[tokio::test]
    async fn install_fails_when_offline() {
        let network = online_network();
        network.set_offline(true);
        let m = manager_with(CacheConfig::default(), network);

        let mut event = InstallEvent::new();
        m.on_install(&mut event);
        let (lifetime, _) = event.into_parts();
        assert!(matches!(lifetime.settled().await, Err(Error::Network(_))));
        assert!(current_cache(&m).await.is_empty().unwrap());
    }

    // =========================================================================
    // Activate
    // =========================================================================

    #[tokio::test]
    async fn activate_deletes_old_versions_only() {
        let m = manager_with(CacheConfig::default(), online_network());
        m.storage().open("languagepapi-v0").await.unwrap();
        m.storage().open("languagepapi-v1").await.unwrap();
        m.storage().open("someone-else-v0").await.unwrap();

        let mut event = ActivateEvent::new();
        m.on_activate(&mut event);
        let (lifetime, claim) = event.into_parts();
        lifetime.settled().await.unwrap();

        assert!(claim);
        assert_eq!(
            m.storage().keys().await.unwrap(),
            vec!["languagepapi-v1".to_string(), "someone-else-v0".to_string()]
        );
    }

    #[tokio::test]
    async fn activate_reports_deleted_names() {
        let m = manager_with(CacheConfig::default().with_version("v3"), online_network());
        for v in ["v1", "v2", "v3"] {
            m.storage().open(&format!("languagepapi-{v}")).await.unwrap();
        }
        let deleted = m.activate().await.unwrap();
        assert_eq!(deleted, vec!["languagepapi-v1", "languagepapi-v2"]);
    }

    // =========================================================================
    // Fetch: passthrough
    // =========================================================================

    #[tokio::test]
    async fn non_get_is_not_intercepted() {
        let network = online_network();
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));
        let req = Request::get(&url("/api/progress"))
            .unwrap()
            .with_method(Method::POST);

        assert!(dispatch(&m, req).await.is_none());
        assert_eq!(network.total_calls(), 0);
        assert_eq!(m.stats().snapshot().passthrough, 1);
    }

    // =========================================================================
    // Fetch: cache-first
    // =========================================================================

    #[tokio::test]
    async fn cached_static_asset_skips_network() {
        let network = online_network();
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));
        let stored = Response::new(200, "cached-css").with_header("content-type", "text/css");
        current_cache(&m)
            .await
            .put(&key("/static/style.css"), &stored)
            .await
            .unwrap();

        let res = dispatch(&m, Request::get(&url("/static/style.css")).unwrap())
            .await
            .unwrap();
        assert_eq!(res, stored);
        assert_eq!(network.total_calls(), 0);
        assert_eq!(m.stats().snapshot().cache_hits, 1);
    }

    #[tokio::test]
    async fn uncached_static_asset_fetched_once_and_stored() {
        let network = online_network();
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));

        let res = dispatch(&m, Request::get(&url("/static/logo.svg")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.body, bytes::Bytes::from_static(b"<svg/>"));
        assert_eq!(network.calls_to("/static/logo.svg"), 1);
        assert!(
            current_cache(&m)
                .await
                .lookup(&key("/static/logo.svg"))
                .await
                .unwrap()
                .is_some()
        );

        // Second request is served from cache.
        dispatch(&m, Request::get(&url("/static/logo.svg")).unwrap()).await;
        assert_eq!(network.calls_to("/static/logo.svg"), 1);
    }

    #[tokio::test]
    async fn static_error_status_is_returned_but_not_stored() {
        let network = online_network();
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));

        let res = dispatch(&m, Request::get(&url("/static/nope.js")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status, 404);
        assert!(current_cache(&m).await.is_empty().unwrap());
    }

    #[tokio::test]
    async fn static_miss_while_offline_is_503() {
        let network = online_network();
        network.set_offline(true);
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));

        let res = dispatch(&m, Request::get(&url("/static/logo.svg")).unwrap())
            .await
            .unwrap();
        assert_eq!(res, Response::offline());
        assert_eq!(network.calls_to("/static/logo.svg"), 1);
    }

    #[tokio::test]
    async fn static_asset_served_from_previous_version_store() {
        let network = online_network();
        network.set_offline(true);
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));
        let old = m.storage().open("languagepapi-v0").await.unwrap();
        old.put(&key("/static/style.css"), &Response::new(200, "old"))
            .await
            .unwrap();

        let res = dispatch(&m, Request::get(&url("/static/style.css")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.body, bytes::Bytes::from_static(b"old"));
    }

    // =========================================================================
    // Fetch: network-first
    // =========================================================================

    #[tokio::test]
    async fn root_updated_on_network_success() {
        let network = online_network();
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));
        current_cache(&m)
            .await
            .put(&key("/"), &Response::new(200, "old shell"))
            .await
            .unwrap();

        network.set_route("/", Response::new(200, "new shell"));
        let res = dispatch(&m, Request::navigate(&url("/")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.body, bytes::Bytes::from_static(b"new shell"));

        let stored = current_cache(&m).await.lookup(&key("/")).await.unwrap().unwrap();
        assert_eq!(stored.body, bytes::Bytes::from_static(b"new shell"));
    }

    #[tokio::test]
    async fn root_falls_back_to_cache_when_offline() {
        let network = online_network();
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));
        dispatch(&m, Request::navigate(&url("/")).unwrap()).await;

        network.set_offline(true);
        let res = dispatch(&m, Request::get(&url("/")).unwrap()).await.unwrap();
        assert_eq!(res.body, bytes::Bytes::from_static(b"<html>shell</html>"));
        assert_eq!(m.stats().snapshot().fallback_exact, 1);
    }

    #[tokio::test]
    async fn non_root_pages_are_not_stored() {
        let network = online_network();
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));
        let res = dispatch(&m, Request::get(&url("/api/progress")).unwrap())
            .await
            .unwrap();
        assert!(res.is_ok());
        assert!(current_cache(&m).await.is_empty().unwrap());
    }

    #[tokio::test]
    async fn error_status_from_network_is_passed_through() {
        let network = online_network();
        network.set_route("/", Response::new(500, "boom"));
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));
        current_cache(&m)
            .await
            .put(&key("/"), &Response::new(200, "shell"))
            .await
            .unwrap();

        let res = dispatch(&m, Request::navigate(&url("/")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status, 500);
        let stored = current_cache(&m).await.lookup(&key("/")).await.unwrap().unwrap();
        assert_eq!(stored.body, bytes::Bytes::from_static(b"shell"));
    }

    #[tokio::test]
    async fn offline_navigation_gets_shell() {
        let network = online_network();
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));
        m.install().await.unwrap();

        network.set_offline(true);
        let res = dispatch(&m, Request::navigate(&url("/lesson/4")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.body, bytes::Bytes::from_static(b"<html>shell</html>"));
        assert_eq!(m.stats().snapshot().fallback_shell, 1);
    }

    #[tokio::test]
    async fn offline_navigation_without_shell_is_503() {
        let network = online_network();
        network.set_offline(true);
        let m = manager_with(CacheConfig::default(), network);

        let res = dispatch(&m, Request::navigate(&url("/lesson/4")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.status, 503);
        assert_eq!(res.status_text, "Service Unavailable");
    }

    #[tokio::test]
    async fn offline_subresource_does_not_get_shell() {
        let network = online_network();
        let m = manager_with(CacheConfig::default(), Arc::clone(&network));
        m.install().await.unwrap();

        network.set_offline(true);
        let res = dispatch(&m, Request::get(&url("/api/progress")).unwrap())
            .await
            .unwrap();
        assert_eq!(res, Response::offline());
        assert_eq!(m.stats().snapshot().offline, 1);
    }

    // =========================================================================
    // Write failures
    // =========================================================================

    /// Memory storage that can reject writes and counts store listings.
    #[derive(Default)]
    struct TestStorage {
        inner: MemoryStorage,
        /// Key suffix whose writes fail; `Some("")` rejects every write.
        fail_put: Option<&'static str>,
        listings: AtomicUsize,
    }

    impl TestStorage {
        fn failing(inner: MemoryStorage, fail_put: &'static str) -> Self {
            Self {
                inner,
                fail_put: Some(fail_put),
                listings: AtomicUsize::new(0),
            }
        }
    }

    struct TestCache {
        inner: MemoryCache,
        fail_put: Option<&'static str>,
    }

    #[async_trait]
    impl CacheStorage for TestStorage {
        type Cache = TestCache;

        async fn open(&self, name: &str) -> Result<TestCache> {
            Ok(TestCache {
                inner: self.inner.open(name).await?,
                fail_put: self.fail_put,
            })
        }
        async fn has(&self, name: &str) -> Result<bool> {
            self.inner.has(name).await
        }
        async fn keys(&self) -> Result<Vec<String>> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            self.inner.keys().await
        }
        async fn delete(&self, name: &str) -> Result<bool> {
            self.inner.delete(name).await
        }
    }

    #[async_trait]
    impl Cache for TestCache {
        async fn lookup(&self, key: &RequestKey) -> Result<Option<Response>> {
            self.inner.lookup(key).await
        }
        async fn put(&self, key: &RequestKey, response: &Response) -> Result<()> {
            if self.fail_put.is_some_and(|suffix| key.as_str().ends_with(suffix)) {
                return Err(Error::Storage("quota exceeded".to_string()));
            }
            self.inner.put(key, response).await
        }
        async fn delete(&self, key: &RequestKey) -> Result<bool> {
            self.inner.delete(key).await
        }
        async fn keys(&self) -> Result<Vec<RequestKey>> {
            self.inner.keys().await
        }
    }

    fn test_manager(storage: TestStorage) -> CacheManager<TestStorage, Arc<MockNetwork>> {
        CacheManager::new(
            CacheConfig::default(),
            Url::parse(BASE).unwrap(),
            storage,
            online_network(),
        )
    }

    #[tokio::test]
    async fn failed_cache_write_still_returns_response() {
        let m = test_manager(TestStorage::failing(MemoryStorage::new(), ""));

        let res = dispatch(&m, Request::get(&url("/static/style.css")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.body, bytes::Bytes::from_static(b"body{}"));
        let snap = m.stats().snapshot();
        assert_eq!(snap.write_failures, 1);
        assert_eq!(snap.stored, 0);
    }

    #[tokio::test]
    async fn failed_install_write_fails_install() {
        let m = test_manager(TestStorage::failing(MemoryStorage::new(), ""));
        assert!(matches!(m.install().await, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn failed_reinstall_keeps_existing_entries() {
        let storage = MemoryStorage::new();
        let first = CacheManager::new(
            CacheConfig::default(),
            Url::parse(BASE).unwrap(),
            storage.clone(),
            online_network(),
        );
        first.install().await.unwrap();

        // "/" and style.css are overwritten before logo.svg fails.
        let network = online_network();
        network.set_route("/", Response::new(200, "new shell"));
        network.set_route("/static/style.css", Response::new(200, "new css"));
        let second = CacheManager::new(
            CacheConfig::default(),
            Url::parse(BASE).unwrap(),
            TestStorage::failing(storage.clone(), "/static/logo.svg"),
            network,
        );
        assert!(matches!(second.install().await, Err(Error::Storage(_))));

        let cache = storage.open("languagepapi-v1").await.unwrap();
        assert_eq!(cache.len().unwrap(), 5);
        let shell = cache.lookup(&key("/")).await.unwrap().unwrap();
        assert_eq!(shell.body, bytes::Bytes::from_static(b"<html>shell</html>"));
        let css = cache.lookup(&key("/static/style.css")).await.unwrap().unwrap();
        assert_eq!(css.body, bytes::Bytes::from_static(b"body{}"));
        assert!(first.is_installed().await.unwrap());
    }

    #[tokio::test]
    async fn failed_first_install_leaves_no_entries() {
        let storage = MemoryStorage::new();
        let m = CacheManager::new(
            CacheConfig::default(),
            Url::parse(BASE).unwrap(),
            TestStorage::failing(storage.clone(), "/static/logo.svg"),
            online_network(),
        );
        assert!(m.install().await.is_err());
        assert!(storage.open("languagepapi-v1").await.unwrap().is_empty().unwrap());
        assert!(!m.is_installed().await.unwrap());
    }

    #[tokio::test]
    async fn install_opens_store_before_fetching() {
        let network = online_network();
        network.set_offline(true);
        let m = manager_with(CacheConfig::default(), network);
        assert!(m.install().await.is_err());
        assert!(m.storage().has("languagepapi-v1").await.unwrap());
        assert!(!m.is_installed().await.unwrap());
    }

    #[tokio::test]
    async fn current_store_hit_does_not_list_stores() {
        let m = test_manager(TestStorage::default());
        m.install().await.unwrap();

        let res = dispatch(&m, Request::get(&url("/static/style.css")).unwrap())
            .await
            .unwrap();
        assert_eq!(res.body, bytes::Bytes::from_static(b"body{}"));
        assert_eq!(m.storage().listings.load(Ordering::SeqCst), 0);

        dispatch(&m, Request::get(&url("/static/other.css")).unwrap()).await;
        assert_eq!(m.storage().listings.load(Ordering::SeqCst), 1);
    }
}
