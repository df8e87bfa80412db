//! Session management
//!
//! [`SessionManager`] owns the single industrial session. Everything else
//! reaches it through a [`SessionWatcher`], which hands out the current
//! generation-numbered [`SessionHandle`] on request instead of letting
//! callers cache one.
//!
//! A reconnect holds the write side of a gate lock for its whole duration;
//! writes hold the read side through a [`SessionLease`], so the two never
//! overlap.

use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OwnedRwLockReadGuard, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uabridge_core::{ApplicationIdentity, Endpoint, Identity, SessionState};
use uabridge_protocol::{CloseReason, ConnectRequest, UaClient, UaSession};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::config::BridgeConfig;
use crate::error::SessionError;
use crate::resolver::EndpointResolver;

/// Session parameters
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub server_address: String,
    pub application: ApplicationIdentity,
    pub identity: Identity,
    pub session_name: String,
    pub session_timeout: Duration,
    pub connect_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl SessionSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            server_address: config.server_address.clone(),
            application: config.application.clone(),
            identity: config.identity(),
            session_name: config.session_name.clone(),
            session_timeout: config.session_timeout(),
            connect_timeout: config.connect_timeout(),
            backoff: config.reconnect.clone(),
        }
    }
}

/// A live session together with the generation it was opened in
#[derive(Clone)]
pub struct SessionHandle {
    generation: u64,
    endpoint: Endpoint,
    session: Arc<dyn UaSession>,
}

impl SessionHandle {
    /// Starts at 1 and increases with every (re)connect
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn session(&self) -> &Arc<dyn UaSession> {
        &self.session
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("generation", &self.generation)
            .field("endpoint", &self.endpoint.url)
            .field("session_id", &self.session.session_id())
            .finish()
    }
}

#[derive(Clone, Default)]
struct SessionSnapshot {
    state: SessionState,
    generation: u64,
    handle: Option<SessionHandle>,
}

/// Why a lease could not be granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseError {
    /// No usable session before the deadline
    Timeout,
    /// The session manager is gone
    Closed,
}

/// Shared read access to the current session. A reconnect cannot start
/// while a lease is held.
pub struct SessionLease {
    handle: SessionHandle,
    _guard: OwnedRwLockReadGuard<()>,
}

impl SessionLease {
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn session(&self) -> &Arc<dyn UaSession> {
        &self.handle.session
    }

    pub fn generation(&self) -> u64 {
        self.handle.generation
    }
}

/// Capability to observe the session and borrow its current handle
#[derive(Clone)]
pub struct SessionWatcher {
    rx: watch::Receiver<SessionSnapshot>,
    gate: Arc<RwLock<()>>,
}

impl SessionWatcher {
    pub fn state(&self) -> SessionState {
        self.rx.borrow().state
    }

    /// Current handle, if the session is active
    pub fn current(&self) -> Option<SessionHandle> {
        let snapshot = self.rx.borrow();
        match snapshot.state {
            SessionState::Active => snapshot.handle.clone(),
            _ => None,
        }
    }

    /// Generation of the latest session, 0 before the first connect
    pub fn generation(&self) -> u64 {
        self.rx.borrow().generation
    }

    /// Wait for an active session whose generation is at least
    /// `min_generation`. Returns `None` once the manager is dropped.
    pub async fn wait_active(&self, min_generation: u64) -> Option<SessionHandle> {
        let mut rx = self.rx.clone();
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if snapshot.state == SessionState::Active {
                    if let Some(handle) = &snapshot.handle {
                        if handle.generation >= min_generation {
                            return Some(handle.clone());
                        }
                    }
                }
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// Wait for a change of state
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Borrow the current session for one operation.
    ///
    /// Waits for an in-progress reconnect to finish, then for an active
    /// session of at least `min_generation`, giving up at `deadline`.
    pub async fn lease(
        &self,
        min_generation: u64,
        deadline: Instant,
    ) -> Result<SessionLease, LeaseError> {
        loop {
            let guard = timeout_at(deadline, Arc::clone(&self.gate).read_owned())
                .await
                .map_err(|_| LeaseError::Timeout)?;

            if let Some(handle) = self.current() {
                if handle.generation >= min_generation {
                    return Ok(SessionLease {
                        handle,
                        _guard: guard,
                    });
                }
            }
            drop(guard);

            match timeout_at(deadline, self.wait_active(min_generation)).await {
                Ok(Some(_)) => continue,
                Ok(None) => return Err(LeaseError::Closed),
                Err(_) => return Err(LeaseError::Timeout),
            }
        }
    }
}

/// Owner of the industrial session
pub struct SessionManager {
    client: Arc<dyn UaClient>,
    resolver: EndpointResolver,
    settings: SessionSettings,
    state_tx: watch::Sender<SessionSnapshot>,
    gate: Arc<RwLock<()>>,
    generation: AtomicU64,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl SessionManager {
    pub fn new(
        client: Arc<dyn UaClient>,
        resolver: EndpointResolver,
        settings: SessionSettings,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(SessionSnapshot::default());
        Arc::new(Self {
            client,
            resolver,
            settings,
            state_tx,
            gate: Arc::new(RwLock::new(())),
            generation: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn watcher(&self) -> SessionWatcher {
        SessionWatcher {
            rx: self.state_tx.subscribe(),
            gate: Arc::clone(&self.gate),
        }
    }

    pub fn current_state(&self) -> SessionState {
        self.state_tx.borrow().state
    }

    fn publish(&self, state: SessionState, handle: Option<SessionHandle>) {
        self.state_tx.send_modify(|snapshot| {
            snapshot.state = state;
            if let Some(handle) = &handle {
                snapshot.generation = handle.generation;
            }
            snapshot.handle = handle;
        });
    }

    /// Record a transitional state unless the manager has been stopped
    fn set_state(&self, state: SessionState) {
        self.state_tx.send_if_modified(|s| {
            if self.cancel.is_cancelled() {
                return false;
            }
            s.state = state;
            true
        });
    }

    /// Open a session against `endpoint`. Single attempt.
    pub async fn start(&self, endpoint: Endpoint) -> Result<SessionHandle, SessionError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SessionError::Stopped);
        }
        self.set_state(SessionState::Connecting);

        let request = ConnectRequest {
            endpoint: endpoint.clone(),
            application: self.settings.application.clone(),
            identity: self.settings.identity.clone(),
            session_name: self.settings.session_name.clone(),
            session_timeout: self.settings.session_timeout,
        };
        debug!(
            "Opening session {} on {} as {:?}",
            request.session_name, endpoint.url, request.identity
        );

        let session = match timeout(self.settings.connect_timeout, self.client.connect(&request))
            .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => return Err(SessionError::Connect(e)),
            Err(_) => return Err(SessionError::Timeout(self.settings.connect_timeout)),
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = SessionHandle {
            generation,
            endpoint,
            session,
        };

        // Checked under the watch lock so a concurrent stop() either sees
        // this handle or we see its cancellation
        let published = self.state_tx.send_if_modified(|snapshot| {
            if self.cancel.is_cancelled() {
                return false;
            }
            snapshot.state = SessionState::Active;
            snapshot.generation = generation;
            snapshot.handle = Some(handle.clone());
            true
        });
        if !published {
            debug!(
                "Stopped while connecting; closing session {}",
                handle.session.session_id()
            );
            if timeout(self.settings.connect_timeout, handle.session.close())
                .await
                .is_err()
            {
                warn!("Timed out closing session");
            }
            return Err(SessionError::Stopped);
        }

        info!(
            "Session {} active on {} (generation {})",
            handle.session.session_id(),
            handle.endpoint.url,
            generation
        );
        Ok(handle)
    }

    /// Resolve and start until it works or the manager is stopped
    async fn establish(&self) -> Result<SessionHandle, SessionError> {
        let mut backoff = Backoff::new(self.settings.backoff.clone());
        loop {
            if self.cancel.is_cancelled() {
                return Err(SessionError::Stopped);
            }
            let attempt = backoff.failures() + 1;
            info!(
                "Connecting to {} (attempt {})",
                self.settings.server_address, attempt
            );

            let result = match self.resolver.resolve(&self.settings.server_address).await {
                Ok(endpoint) => self.start(endpoint).await,
                Err(e) => Err(SessionError::Discovery(e)),
            };

            match result {
                Ok(handle) => return Ok(handle),
                Err(SessionError::Stopped) => return Err(SessionError::Stopped),
                Err(e) => {
                    self.set_state(SessionState::Faulted);
                    let delay = backoff.next_delay();
                    if backoff.just_became_fatal() {
                        error!(
                            "Server {} unreachable after {} consecutive failures; still retrying",
                            self.settings.server_address,
                            backoff.failures()
                        );
                    }
                    if backoff.is_fatal() {
                        error!("Attempt {} failed: {}; retrying in {:?}", attempt, e, delay);
                    } else {
                        warn!("Attempt {} failed: {}; retrying in {:?}", attempt, e, delay);
                    }

                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(SessionError::Stopped),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Establish the first session, retrying with backoff, then keep it
    /// alive in the background.
    pub async fn connect(self: &Arc<Self>) -> Result<SessionHandle, SessionError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SessionError::AlreadyStarted);
        }
        let handle = self.establish().await?;

        let mut supervisor = self.supervisor.lock();
        if self.cancel.is_cancelled() {
            // stop() already ran or is waiting for this lock; it closes the handle
            return Err(SessionError::Stopped);
        }
        let manager = Arc::clone(self);
        *supervisor = Some(tokio::spawn(async move { manager.supervise().await }));
        Ok(handle)
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            let Some(handle) = self.state_tx.borrow().handle.clone() else {
                break;
            };

            let reason = tokio::select! {
                _ = self.cancel.cancelled() => break,
                reason = handle.session.closed() => reason,
            };
            if self.cancel.is_cancelled() {
                break;
            }
            let detail = match reason {
                CloseReason::Requested => "closed".to_string(),
                CloseReason::Lost(detail) => detail,
            };
            warn!(
                "Session {} lost (generation {}): {}",
                handle.session.session_id(),
                handle.generation,
                detail
            );

            // Blocks until in-flight writes release their leases
            let _gate = tokio::select! {
                _ = self.cancel.cancelled() => break,
                guard = self.gate.write() => guard,
            };
            self.publish(SessionState::Faulted, None);
            let _ = timeout(self.settings.connect_timeout, handle.session.close()).await;
            drop(handle);

            match self.establish().await {
                Ok(handle) => info!("Reconnected (generation {})", handle.generation),
                Err(_) => break,
            }
        }
        debug!("Session supervisor exiting");
    }

    /// Close the session and stop reconnecting. Idempotent.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let task = self.supervisor.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let handle = self.state_tx.borrow().handle.clone();
        if let Some(handle) = handle {
            self.state_tx.send_modify(|s| s.state = SessionState::Closing);
            match timeout(self.settings.connect_timeout, handle.session.close()).await {
                Ok(Ok(())) => info!("Session {} closed", handle.session.session_id()),
                Ok(Err(e)) => warn!("Error closing session: {}", e),
                Err(_) => warn!("Timed out closing session"),
            }
        }
        self.publish(SessionState::Closed, None);
    }
}
