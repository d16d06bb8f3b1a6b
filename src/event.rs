//! Extendable lifecycle events.
//!
//! Handlers never block: they register pending work with
//! [`ExtendableEvent::wait_until`] and return. The host then keeps the event
//! alive with [`ExtendableEvent::settled`] until every registered future has
//! finished.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::request::Request;
use crate::response::Response;

/// Lifetime-extension capability shared by every lifecycle event.
#[derive(Debug, Clone, Default)]
pub struct ExtendableEvent {
    tracker: TaskTracker,
    errors: Arc<Mutex<Vec<Error>>>,
}

impl ExtendableEvent {
    /// Creates an event with no pending work.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps the event alive until `work` completes. An error from `work`
    /// fails the event.
    ///
    /// Must be called from within a tokio runtime.
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let errors = Arc::clone(&self.errors);
        self.tracker.spawn(async move {
            if let Err(e) = work.await {
                if let Ok(mut errors) = errors.lock() {
                    errors.push(e);
                }
            }
        });
    }

    /// Number of registered futures still running.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Waits for all registered work and returns the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by a `wait_until` future.
    pub async fn settled(self) -> Result<()> {
        self.tracker.close();
        self.tracker.wait().await;
        let first = self
            .errors
            .lock()
            .map_err(|_| Error::Storage("event error list poisoned".to_string()))?
            .drain(..)
            .next();
        first.map_or(Ok(()), Err)
    }
}

/// Dispatched once when a new version is installed.
#[derive(Debug, Default)]
pub struct InstallEvent {
    lifetime: ExtendableEvent,
    skip_waiting: bool,
}

impl InstallEvent {
    /// Creates an install event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`ExtendableEvent::wait_until`].
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.lifetime.wait_until(work);
    }

    /// Requests activation without waiting for older clients to close.
    pub const fn skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    /// Whether the handler asked to skip waiting.
    #[must_use]
    pub const fn skips_waiting(&self) -> bool {
        self.skip_waiting
    }

    /// Splits the event into its lifetime and skip-waiting flag.
    #[must_use]
    pub fn into_parts(self) -> (ExtendableEvent, bool) {
        (self.lifetime, self.skip_waiting)
    }
}

/// Dispatched once when an installed version takes over.
#[derive(Debug, Default)]
pub struct ActivateEvent {
    lifetime: ExtendableEvent,
    claim: bool,
}

impl ActivateEvent {
    /// Creates an activate event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// See [`ExtendableEvent::wait_until`].
    pub fn wait_until<F>(&self, work: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.lifetime.wait_until(work);
    }

    /// Requests control over all open clients once activation finishes.
    pub const fn claim_clients(&mut self) {
        self.claim = true;
    }

    /// Splits the event into its lifetime and claim flag.
    #[must_use]
    pub fn into_parts(self) -> (ExtendableEvent, bool) {
        (self.lifetime, self.claim)
    }
}

/// Dispatched for every request made by a controlled client.
pub struct FetchEvent {
    request: Request,
    lifetime: ExtendableEvent,
    response: Option<BoxFuture<'static, Result<Response>>>,
}

impl std::fmt::Debug for FetchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchEvent")
            .field("request", &self.request)
            .field("responded", &self.response.is_some())
            .finish_non_exhaustive()
    }
}

impl FetchEvent {
    /// Creates a fetch event for `request`.
    #[must_use]
    pub fn new(request: Request) -> Self {
        Self {
            request,
            lifetime: ExtendableEvent::new(),
            response: None,
        }
    }

    /// The intercepted request.
    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.request
    }

    /// Handle for registering background work, such as cache writes.
    #[must_use]
    pub fn lifetime(&self) -> ExtendableEvent {
        self.lifetime.clone()
    }

    /// Takes over the response for this request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyResponded`] if called twice.
    pub fn respond_with<F>(&mut self, response: F) -> Result<()>
    where
        F: Future<Output = Result<Response>> + Send + 'static,
    {
        if self.response.is_some() {
            return Err(Error::AlreadyResponded);
        }
        self.response = Some(Box::pin(response));
        Ok(())
    }

    /// Whether a handler called `respond_with`.
    #[must_use]
    pub const fn is_intercepted(&self) -> bool {
        self.response.is_some()
    }

    /// Splits the event into request, lifetime and the handler's response, if any.
    #[must_use]
    pub fn into_parts(
        self,
    ) -> (
        Request,
        ExtendableEvent,
        Option<BoxFuture<'static, Result<Response>>>,
    ) {
        (self.request, self.lifetime, self.response)
    }
}
