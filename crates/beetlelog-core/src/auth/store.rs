//! The session store: single owner of the token pair for one execution context.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};

use super::exchange::{AuthError, AuthExchange};
use super::refresh::RefreshCoordinator;
use super::session::Session;
use crate::storage::{DurableStore, StorageEvent, ACCESS_TOKEN_KEY, REFRESH_TOKEN_KEY};

/// Owns the access/refresh token pair, mirrors it into durable storage and
/// keeps it in step with changes other contexts make to that storage.
///
/// Only `login`, `logout` and `refresh_access` change the session from this
/// side; everything else reads.
pub struct SessionStore {
    exchange: Arc<dyn AuthExchange>,
    storage: Arc<dyn DurableStore>,
    state: watch::Sender<Session>,
    /// Serializes memory + storage updates so both see the same order.
    /// Holds the session generation, bumped on every transition.
    write_lock: Mutex<u64>,
    refresh: RefreshCoordinator,
    timeout: Duration,
}

impl SessionStore {
    /// Create the store, restore any persisted tokens and start following
    /// external storage changes. Must be called from within a tokio runtime.
    pub fn init(
        exchange: Arc<dyn AuthExchange>,
        storage: Arc<dyn DurableStore>,
        timeout: Duration,
    ) -> Arc<Self> {
        let restored = load_session(storage.as_ref());
        debug!(
            authenticated = restored.is_authenticated(),
            has_refresh = restored.refresh_token.is_some(),
            "Session restored"
        );

        let store = Arc::new(Self {
            exchange,
            storage,
            state: watch::Sender::new(restored),
            write_lock: Mutex::new(0),
            refresh: RefreshCoordinator::new(),
            timeout,
        });
        let events = store.storage.subscribe();
        tokio::spawn(follow_storage(Arc::downgrade(&store), events));
        store
    }

    // ===== Reads =====

    pub fn is_authenticated(&self) -> bool {
        self.state.borrow().is_authenticated()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.borrow().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state.borrow().refresh_token.clone()
    }

    pub fn snapshot(&self) -> Session {
        self.state.borrow().clone()
    }

    /// Observe every session transition, including forced logouts and
    /// changes made by other contexts. Navigation is up to the caller.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.state.subscribe()
    }

    // ===== Transitions =====

    /// Log in, returning whether it worked. The session is untouched on failure.
    pub async fn login(&self, username: &str, password: &str) -> bool {
        match self.try_login(username, password).await {
            Ok(()) => true,
            Err(e) => {
                warn!(username, error = %e, "Login failed");
                false
            }
        }
    }

    /// Like `login`, but keeps the reason for failure for display
    pub async fn try_login(&self, username: &str, password: &str) -> Result<(), AuthError> {
        let pair = self.bounded(self.exchange.login(username, password)).await?;

        let mut generation = self.lock_writes();
        *generation += 1;
        self.state.send_replace(Session::from(pair.clone()));
        self.persist(ACCESS_TOKEN_KEY, Some(&pair.access));
        self.persist(REFRESH_TOKEN_KEY, Some(&pair.refresh));
        info!(username, "Logged in");
        Ok(())
    }

    /// Clear both tokens here and in storage. Safe to call when logged out.
    pub fn logout(&self) {
        let mut generation = self.lock_writes();
        self.clear_locked(&mut generation);
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Returns `None` without a network call when no refresh token is held.
    /// A failure ends the session, unless the session already changed
    /// (login, logout, another context) while the exchange was in flight.
    /// In that case the newer session is kept and its access token returned.
    pub async fn refresh_access(&self) -> Option<String> {
        let (refresh_token, started) = {
            let generation = self.lock_writes();
            (self.refresh_token(), *generation)
        };
        let Some(refresh_token) = refresh_token else {
            debug!("No refresh token; skipping refresh");
            return None;
        };

        let grant = match self.bounded(self.exchange.refresh(&refresh_token)).await {
            Ok(grant) => grant,
            Err(e) => {
                if self.end_session_since(started) {
                    warn!(error = %e, "Token refresh failed; ending session");
                    return None;
                }
                debug!(error = %e, "Stale token refresh failed; keeping newer session");
                return self.access_token();
            }
        };

        let mut generation = self.lock_writes();
        if *generation != started {
            debug!("Session changed during refresh; discarding new token");
            return self.state.borrow().access_token.clone();
        }
        *generation += 1;
        self.state.send_modify(|session| {
            session.access_token = Some(grant.access.clone());
            if let Some(ref rotated) = grant.refresh {
                session.refresh_token = Some(rotated.clone());
            }
        });

        self.persist(ACCESS_TOKEN_KEY, Some(&grant.access));
        if let Some(ref rotated) = grant.refresh {
            self.persist(REFRESH_TOKEN_KEY, Some(rotated));
        }
        debug!(rotated = grant.refresh.is_some(), "Access token refreshed");
        Some(grant.access)
    }

    /// `refresh_access`, but concurrent callers share a single refresh.
    pub async fn coordinated_refresh(self: &Arc<Self>) -> Option<String> {
        let store = Arc::clone(self);
        self.refresh
            .run(move || async move {
                let started = *store.lock_writes();
                match AssertUnwindSafe(store.refresh_access()).catch_unwind().await {
                    Ok(token) => token,
                    Err(_) => {
                        error!("Token refresh panicked; ending session");
                        store.end_session_since(started);
                        None
                    }
                }
            })
            .await
    }

    // ===== Internals =====

    fn lock_writes(&self) -> MutexGuard<'_, u64> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the session unless it changed after generation `started`
    fn end_session_since(&self, started: u64) -> bool {
        let mut generation = self.lock_writes();
        if *generation != started {
            return false;
        }
        self.clear_locked(&mut generation);
        true
    }

    fn clear_locked(&self, generation: &mut MutexGuard<'_, u64>) {
        **generation += 1;
        let was_set = self.state.send_if_modified(|session| {
            let changed = !session.is_empty();
            *session = Session::default();
            changed
        });
        self.persist(ACCESS_TOKEN_KEY, None);
        self.persist(REFRESH_TOKEN_KEY, None);
        if was_set {
            info!("Logged out");
        }
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, AuthError>
    where
        F: Future<Output = Result<T, AuthError>>,
    {
        tokio::time::timeout(self.timeout, call)
            .await
            .unwrap_or(Err(AuthError::Timeout))
    }

    fn persist(&self, key: &str, value: Option<&str>) {
        let result = match value {
            Some(value) => self.storage.set(key, value),
            None => self.storage.remove(key),
        };
        if let Err(e) = result {
            warn!(key, error = %e, "Failed to persist session token");
        }
    }

    /// Take a value written by another context as authoritative.
    /// The key is re-read, since events may be queued behind newer writes.
    fn apply_external(&self, mut event: StorageEvent) {
        let mut generation = self.lock_writes();
        match self.storage.get(&event.key) {
            Ok(value) => event.value = value,
            Err(e) => debug!(key = %event.key, error = %e, "Using announced value"),
        }
        let changed = self.state.send_if_modified(|session| {
            let slot = match event.key.as_str() {
                ACCESS_TOKEN_KEY => &mut session.access_token,
                REFRESH_TOKEN_KEY => &mut session.refresh_token,
                _ => return false,
            };
            if *slot == event.value {
                return false;
            }
            *slot = event.value.clone();
            true
        });
        if changed {
            *generation += 1;
            info!(
                key = %event.key,
                cleared = event.value.is_none(),
                "Session changed by another context"
            );
        }
    }

    /// Re-read both keys after missing notifications
    fn resync(&self) {
        let stored = load_session(self.storage.as_ref());
        let mut generation = self.lock_writes();
        let changed = self.state.send_if_modified(|session| {
            let changed = *session != stored;
            *session = stored;
            changed
        });
        if changed {
            *generation += 1;
        }
    }
}

fn load_session(storage: &dyn DurableStore) -> Session {
    let read = |key: &str| match storage.get(key) {
        Ok(value) => value,
        Err(e) => {
            warn!(key, error = %e, "Failed to read session token");
            None
        }
    };
    Session {
        access_token: read(ACCESS_TOKEN_KEY),
        refresh_token: read(REFRESH_TOKEN_KEY),
    }
}

async fn follow_storage(store: Weak<SessionStore>, mut events: broadcast::Receiver<StorageEvent>) {
    loop {
        let received = events.recv().await;
        let Some(store) = store.upgrade() else {
            break;
        };
        match received {
            Ok(event) => store.apply_external(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Missed storage notifications; reloading session");
                store.resync();
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("Stopped following session storage");
}
