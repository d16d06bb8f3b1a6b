//! Host runtime for the cache manager.
//!
//! [`ServiceWorker`] owns one manager version and drives it through the
//! install/activate lifecycle, then routes client requests through its fetch
//! handler. [`Clients`] tracks which version controls each open client.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use reqwest::Url;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::event::{ActivateEvent, FetchEvent, InstallEvent};
use crate::manager::CacheManager;
use crate::network::Network;
use crate::request::Request;
use crate::response::Response;
use crate::storage::CacheStorage;

/// Lifecycle state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Created, nothing dispatched yet.
    Parsed,
    /// Install event dispatched.
    Installing,
    /// Install succeeded; waiting to activate.
    Installed,
    /// Activate event dispatched.
    Activating,
    /// Handling fetches.
    Activated,
    /// Failed or replaced. Terminal.
    Redundant,
}

impl WorkerState {
    /// Whether moving from `self` to `next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Parsed, Self::Installing)
                | (Self::Installing, Self::Installed)
                | (Self::Installed, Self::Activating)
                | (Self::Activating, Self::Activated)
                | (
                    Self::Installing | Self::Installed | Self::Activating | Self::Activated,
                    Self::Redundant
                )
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        };
        f.write_str(s)
    }
}

/// An open client (page) that the worker may control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    /// Client id.
    pub id: Uuid,
    /// URL the client was opened at.
    pub url: Url,
    /// Cache name of the controlling worker, if any.
    pub controller: Option<String>,
}

/// Registry of open clients.
#[derive(Debug, Default)]
pub struct Clients {
    clients: Mutex<Vec<Client>>,
}

impl Clients {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut Vec<Client>) -> T) -> T {
        let mut guard = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    /// Registers a new client, optionally already controlled.
    pub fn open(&self, url: Url, controller: Option<String>) -> Uuid {
        let id = Uuid::new_v4();
        self.with(|c| {
            c.push(Client {
                id,
                url,
                controller,
            });
        });
        id
    }

    /// Removes a client. Returns false if it was unknown.
    pub fn close(&self, id: Uuid) -> bool {
        self.with(|c| {
            let before = c.len();
            c.retain(|client| client.id != id);
            c.len() != before
        })
    }

    /// Looks a client up by id.
    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Client> {
        self.with(|c| c.iter().find(|client| client.id == id).cloned())
    }

    /// Number of open clients.
    #[must_use]
    pub fn len(&self) -> usize {
        self.with(|c| c.len())
    }

    /// Returns true if no client is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of clients controlled by something other than `controller`.
    #[must_use]
    pub fn controlled_by_other(&self, controller: &str) -> usize {
        self.with(|c| {
            c.iter()
                .filter(|client| client.controller.as_deref().is_some_and(|v| v != controller))
                .count()
        })
    }

    /// Makes `controller` the controller of every open client. Returns how
    /// many clients changed hands.
    pub fn claim(&self, controller: &str) -> usize {
        self.with(|c| {
            let mut changed = 0;
            for client in c.iter_mut() {
                if client.controller.as_deref() != Some(controller) {
                    client.controller = Some(controller.to_string());
                    changed += 1;
                }
            }
            changed
        })
    }
}

/// One installed version of the cache manager and its lifecycle.
pub struct ServiceWorker<S, N> {
    manager: CacheManager<S, N>,
    clients: Arc<Clients>,
    state: Mutex<WorkerState>,
    skip_waiting: AtomicBool,
    background: TaskTracker,
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
    /// Creates a worker for `manager` sharing the given client registry.
    #[must_use]
    pub fn new(manager: CacheManager<S, N>, clients: Arc<Clients>) -> Self {
        Self {
            manager,
            clients,
            state: Mutex::new(WorkerState::Parsed),
            skip_waiting: AtomicBool::new(false),
            background: TaskTracker::new(),
        }
    }

    /// The manager this worker runs.
    #[must_use]
    pub const fn manager(&self) -> &CacheManager<S, N> {
        &self.manager
    }

    /// The client registry.
    #[must_use]
    pub fn clients(&self) -> &Arc<Clients> {
        &self.clients
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, to: WorkerState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.can_transition_to(to) {
            return Err(Error::InvalidState { from: *state, to });
        }
        log::debug!("{}: {} -> {to}", self.manager.config().cache_name(), *state);
        *state = to;
        Ok(())
    }

    fn fail(&self) {
        let _ = self.transition(WorkerState::Redundant);
    }

    /// Dispatches the install event and waits for it to settle.
    ///
    /// # Errors
    ///
    /// Returns the install failure; the worker is then redundant.
    pub async fn install(&self) -> Result<()> {
        self.transition(WorkerState::Installing)?;
        match self.dispatch_install().await {
            Ok(()) => self.transition(WorkerState::Installed),
            Err(e) => {
                log::error!("Install of {} failed: {e}", self.manager.config().cache_name());
                self.fail();
                Err(e)
            }
        }
    }

    async fn dispatch_install(&self) -> Result<()> {
        let mut event = InstallEvent::new();
        self.manager.on_install(&mut event);
        let (lifetime, skip) = event.into_parts();
        if skip {
            self.skip_waiting.store(true, Ordering::SeqCst);
        }
        lifetime.settled().await
    }

    /// True if activation must wait for clients of an older version to close.
    #[must_use]
    pub fn is_waiting(&self) -> bool {
        !self.skip_waiting.load(Ordering::SeqCst)
            && self
                .clients
                .controlled_by_other(&self.manager.config().cache_name())
                > 0
    }

    /// Dispatches the activate event, waits for it, then claims clients if
    /// the handler asked to.
    ///
    /// # Errors
    ///
    /// Returns the activation failure; the worker is then redundant.
    pub async fn activate(&self) -> Result<()> {
        self.transition(WorkerState::Activating)?;

        let mut event = ActivateEvent::new();
        self.manager.on_activate(&mut event);
        let (lifetime, claim) = event.into_parts();

        if let Err(e) = lifetime.settled().await {
            log::error!("Activation of {} failed: {e}", self.manager.config().cache_name());
            self.fail();
            return Err(e);
        }
        self.transition(WorkerState::Activated)?;

        if claim {
            let name = self.manager.config().cache_name();
            let claimed = self.clients.claim(&name);
            log::info!("{name} claimed {claimed} client(s)");
        }
        Ok(())
    }

    /// Installs, then activates unless older clients hold it back.
    ///
    /// If the install fails but an earlier install of this version left a
    /// complete store behind, the worker carries on with that store.
    ///
    /// # Errors
    ///
    /// Returns the first lifecycle failure.
    pub async fn start(&self) -> Result<()> {
        let name = self.manager.config().cache_name();
        self.transition(WorkerState::Installing)?;
        if let Err(e) = self.dispatch_install().await {
            if !self.manager.is_installed().await.unwrap_or(false) {
                log::error!("Install of {name} failed: {e}");
                self.fail();
                return Err(e);
            }
            log::warn!("Install of {name} failed ({e}), resuming with the existing store");
            self.skip_waiting.store(true, Ordering::SeqCst);
        }
        self.transition(WorkerState::Installed)?;
        self.activate_if_ready().await.map(|_| ())
    }

    /// Activates an installed worker once no older version holds a client.
    /// Returns true if the worker is activated afterwards.
    ///
    /// # Errors
    ///
    /// Returns the activation failure.
    pub async fn activate_if_ready(&self) -> Result<bool> {
        match self.state() {
            WorkerState::Activated => return Ok(true),
            WorkerState::Installed => {}
            _ => return Ok(false),
        }
        if self.is_waiting() {
            log::info!(
                "{} installed, waiting for older clients to close",
                self.manager.config().cache_name()
            );
            return Ok(false);
        }
        self.activate().await?;
        Ok(true)
    }

    /// Closes a client and activates a waiting worker if that was the last
    /// client held by an older version.
    ///
    /// # Errors
    ///
    /// Returns the activation failure.
    pub async fn close_client(&self, id: Uuid) -> Result<bool> {
        if !self.clients.close(id) {
            return Ok(false);
        }
        self.activate_if_ready().await?;
        Ok(true)
    }

    /// Handles a request from a controlled client.
    ///
    /// Until the worker is activated, and for requests the handler leaves
    /// alone, the request goes straight to the network. Work the handler
    /// registered on the event keeps running after the response is returned;
    /// see [`ServiceWorker::idle`].
    ///
    /// # Errors
    ///
    /// Only passthrough requests can fail; intercepted ones always resolve.
    pub async fn fetch(&self, request: Request) -> Result<Response> {
        if self.state() != WorkerState::Activated {
            return self.manager.network().fetch(&request).await;
        }

        let mut event = FetchEvent::new(request);
        self.manager.on_fetch(&mut event)?;
        let (request, lifetime, response) = event.into_parts();

        let result = match response {
            Some(response) => response.await,
            None => self.manager.network().fetch(&request).await,
        };

        self.background.spawn(async move {
            if let Err(e) = lifetime.settled().await {
                log::warn!("Background work for {} failed: {e}", request.url);
            }
        });
        result
    }

    /// Waits until all background work started by [`ServiceWorker::fetch`]
    /// has finished.
    pub async fn idle(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }

    /// Marks the worker redundant, e.g. when a newer version took over.
    pub fn retire(&self) {
        self.fail();
    }
}
