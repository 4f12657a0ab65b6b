use anyhow::Context;
use chrono::{Duration, Utc};
use reqwest::Client;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::codec;
use super::credentials::CredentialStore;
use super::notifier::{AuthEvent, AuthNotifier, AuthObserver, SubscriptionId};
use super::refresh::{Endpoints, IdentityClient, Liveness};
use super::scheduler::{RefreshScheduler, Schedule, DEFAULT_REFRESH_BUFFER_SECS};
use super::single_flight::SingleFlight;
use super::types::{AuthStatus, Freshness, LoginCredentials, SessionState, TokenKind};
use crate::error::{AuthError, RefreshFailure};
use crate::store::KeyValueStore;

/// Tunables for a session manager
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub endpoints: Endpoints,

    /// Lead time before expiry at which renewal happens
    pub refresh_buffer: Duration,

    /// Upper bound on one refresh round-trip
    pub refresh_timeout: std::time::Duration,

    /// Confirm locally valid tokens against the whoami endpoint
    pub liveness_check: bool,

    pub connect_timeout: std::time::Duration,
    pub request_timeout: std::time::Duration,
}

impl SessionOptions {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            endpoints: Endpoints::new(base_url),
            refresh_buffer: Duration::seconds(DEFAULT_REFRESH_BUFFER_SECS as i64),
            refresh_timeout: std::time::Duration::from_secs(30),
            liveness_check: false,
            connect_timeout: std::time::Duration::from_secs(30),
            request_timeout: std::time::Duration::from_secs(300),
        }
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::new("http://localhost:7860")
    }
}

/// State plus a counter bumped whenever the credential pair is replaced or
/// dropped outside a refresh. A refresh that started under an older
/// generation must not write its result.
struct Tracker {
    state: SessionState,
    generation: u64,
}

struct Inner {
    store: CredentialStore,
    identity: IdentityClient,
    http: Client,
    scheduler: RefreshScheduler,
    notifier: AuthNotifier,
    in_flight: SingleFlight<Result<(), RefreshFailure>>,
    tracker: Mutex<Tracker>,
    options: SessionOptions,
}

/// Session manager
/// Owns the credential store, refresh timer, in-flight refresh slot and
/// observer registry for one process. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager with its own HTTP client
    pub fn new(options: SessionOptions, backend: Arc<dyn KeyValueStore>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(options.connect_timeout)
            .timeout(options.request_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self::with_client(options, backend, client))
    }

    /// Create a manager sharing an existing HTTP client
    pub fn with_client(
        options: SessionOptions,
        backend: Arc<dyn KeyValueStore>,
        client: Client,
    ) -> Self {
        let store = CredentialStore::new(backend);

        let initial = match store.get(TokenKind::Access) {
            Some(token) if !codec::is_expired(&token, Duration::zero()) => {
                SessionState::Authenticated
            }
            _ => SessionState::Unauthenticated,
        };

        Self {
            inner: Arc::new(Inner {
                store,
                identity: IdentityClient::new(client.clone(), options.endpoints.clone()),
                http: client,
                scheduler: RefreshScheduler::new(options.refresh_buffer),
                notifier: AuthNotifier::new(),
                in_flight: SingleFlight::new(),
                tracker: Mutex::new(Tracker {
                    state: initial,
                    generation: 0,
                }),
                options,
            }),
        }
    }

    pub fn options(&self) -> &SessionOptions {
        &self.inner.options
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.inner.scheduler
    }

    pub(crate) fn http(&self) -> &Client {
        &self.inner.http
    }

    fn tracker(&self) -> MutexGuard<'_, Tracker> {
        self.inner
            .tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SessionState {
        self.tracker().state
    }

    fn set_state(&self, next: SessionState) {
        transition(&mut self.tracker(), next);
    }

    pub fn subscribe(&self, observer: Arc<dyn AuthObserver>) -> SubscriptionId {
        self.inner.notifier.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.notifier.unsubscribe(id)
    }

    /// Log in with the password grant.
    /// On failure stored credentials are left exactly as they were.
    pub async fn login(&self, credentials: &LoginCredentials) -> Result<(), AuthError> {
        let previous = self.state();
        self.set_state(SessionState::Authenticating);

        let tokens = match self.inner.identity.login(credentials).await {
            Ok(tokens) => tokens,
            Err(e) => {
                tracing::warn!("Login failed: {}", e);
                self.set_state(previous);
                return Err(e);
            }
        };

        let refresh_token = tokens.refresh_token.unwrap_or_default();
        {
            let mut tracker = self.tracker();
            // Any refresh still in flight belongs to the previous pair
            tracker.generation += 1;

            if let Err(e) = self.inner.store.set(&tokens.access_token, &refresh_token) {
                transition(&mut tracker, previous);
                return Err(AuthError::Internal(e.context("Failed to store credentials")));
            }
            if let Err(e) = self
                .inner
                .store
                .set_username(&credentials.username, &tokens.access_token)
            {
                tracing::warn!("Failed to remember username: {:#}", e);
            }

            self.arm_scheduler(&tokens.access_token);
            transition(&mut tracker, SessionState::Authenticated);
        }

        tracing::info!(
            username = %credentials.username,
            expires_at = ?codec::expiry(&tokens.access_token),
            "Login successful"
        );
        self.inner.notifier.publish(AuthEvent::TokensUpdated);
        Ok(())
    }

    /// End the session. The remote call is best-effort; local state is
    /// always cleared.
    pub async fn logout(&self) {
        if let Some(access_token) = self.inner.store.get(TokenKind::Access) {
            let remote = tokio::time::timeout(
                self.inner.options.refresh_timeout,
                self.inner.identity.logout(&access_token),
            )
            .await;

            match remote {
                Ok(Ok(())) => tracing::debug!("Remote logout acknowledged"),
                Ok(Err(e)) => tracing::warn!("Remote logout failed: {:#}", e),
                Err(_) => tracing::warn!("Remote logout timed out"),
            }
        }

        self.clear_session();
        tracing::info!("Logged out");
        self.inner.notifier.publish(AuthEvent::TokensCleared);
    }

    /// Make sure a usable access token is stored, renewing it if needed
    pub async fn ensure_fresh(&self) -> Freshness {
        let store = &self.inner.store;

        let access_token = match store.get(TokenKind::Access) {
            Some(token) => token,
            // The access entry lapsed out of storage; the pair survives as
            // long as the refresh token does
            None if store.get(TokenKind::Refresh).is_some() => {
                tracing::debug!("Access token lapsed from storage; refreshing");
                return self.refresh_and_load().await;
            }
            None => {
                self.set_state(SessionState::Unauthenticated);
                return Freshness::Unauthenticated;
            }
        };

        if !codec::is_structurally_valid(&access_token) {
            tracing::warn!("Stored access token is malformed; clearing credentials");
            self.clear_session();
            self.inner.notifier.publish(AuthEvent::TokensCleared);
            return Freshness::Unauthenticated;
        }

        if codec::is_expired(&access_token, self.inner.options.refresh_buffer) {
            tracing::debug!("Access token expired or inside refresh window");
            return self.refresh_and_load().await;
        }

        if self.inner.options.liveness_check {
            match self.inner.identity.whoami(&access_token).await {
                Liveness::Accepted | Liveness::Unreachable => {}
                Liveness::Rejected { status } => {
                    tracing::info!(status, "Server rejected access token; refreshing");
                    return self.refresh_and_load().await;
                }
            }
        }

        if !self.inner.scheduler.is_armed() {
            self.arm_scheduler(&access_token);
        }
        self.set_state(SessionState::Authenticated);
        Freshness::Authenticated { access_token }
    }

    async fn refresh_and_load(&self) -> Freshness {
        match self.refresh().await {
            // Whatever replaced the session is what callers should see
            Ok(()) | Err(RefreshFailure::Superseded) => {}
            Err(_) => return Freshness::Unauthenticated,
        }
        match self.inner.store.get(TokenKind::Access) {
            Some(access_token) => Freshness::Authenticated { access_token },
            None => Freshness::Unauthenticated,
        }
    }

    /// Renew the credential pair. Concurrent callers share one network call
    /// and all observe its outcome.
    pub async fn refresh(&self) -> Result<(), RefreshFailure> {
        let inner = Arc::clone(&self.inner);

        let outcome = self
            .inner
            .in_flight
            .run(move || async move { SessionManager { inner }.perform_refresh().await })
            .await;

        outcome.unwrap_or_else(|| {
            tracing::error!("Refresh task did not complete");
            Err(RefreshFailure::Transport("refresh task aborted".to_string()))
        })
    }

    pub fn refresh_in_flight(&self) -> bool {
        self.inner.in_flight.in_flight()
    }

    async fn perform_refresh(self) -> Result<(), RefreshFailure> {
        let generation = {
            let mut tracker = self.tracker();
            transition(&mut tracker, SessionState::Refreshing);
            tracker.generation
        };

        let Some(refresh_token) = self.inner.store.get(TokenKind::Refresh) else {
            return self.fail_refresh(generation, RefreshFailure::MissingRefreshToken);
        };

        let timeout = self.inner.options.refresh_timeout;
        let tokens = match tokio::time::timeout(timeout, self.inner.identity.refresh(&refresh_token))
            .await
        {
            Ok(Ok(tokens)) => tokens,
            Ok(Err(e)) => {
                return self.fail_refresh(
                    generation,
                    RefreshFailure::Transport(format!("{:#}", e)),
                )
            }
            Err(_) => {
                return self.fail_refresh(generation, RefreshFailure::Transport(format!(
                    "refresh timed out after {}s",
                    timeout.as_secs()
                )))
            }
        };

        // Issuers may omit a rotated refresh token; keep the current one
        let next_refresh = tokens
            .refresh_token
            .filter(|t| !t.is_empty())
            .unwrap_or(refresh_token);

        {
            let mut tracker = self.tracker();
            if tracker.generation != generation {
                tracing::info!("Session changed while refreshing; discarding renewed credentials");
                return Err(RefreshFailure::Superseded);
            }

            let store = &self.inner.store;
            if let Err(e) = store.set(&tokens.access_token, &next_refresh) {
                drop(tracker);
                return self.fail_refresh(
                    generation,
                    RefreshFailure::Transport(format!(
                        "failed to store refreshed credentials: {:#}",
                        e
                    )),
                );
            }
            if let Some(username) = store.username() {
                if let Err(e) = store.set_username(&username, &tokens.access_token) {
                    tracing::warn!("Failed to extend username entry: {:#}", e);
                }
            }

            self.arm_after_refresh(&tokens.access_token);
            transition(&mut tracker, SessionState::Authenticated);
        }

        tracing::info!(
            expires_at = ?codec::expiry(&tokens.access_token),
            "Token refreshed"
        );
        self.inner.notifier.publish(AuthEvent::TokensUpdated);
        Ok(())
    }

    fn fail_refresh(&self, generation: u64, failure: RefreshFailure) -> Result<(), RefreshFailure> {
        {
            let mut tracker = self.tracker();
            if tracker.generation != generation {
                tracing::info!(error = %failure, "Stale refresh failed; session already replaced");
                return Err(RefreshFailure::Superseded);
            }
            tracing::error!(error = %failure, "Token refresh failed; clearing session");
            self.clear_locked(&mut tracker);
        }
        self.inner.notifier.publish(AuthEvent::RefreshFailed {
            reason: failure.to_string(),
        });
        Err(failure)
    }

    fn clear_session(&self) {
        self.clear_locked(&mut self.tracker());
    }

    fn clear_locked(&self, tracker: &mut Tracker) {
        tracker.generation += 1;
        self.inner.store.clear();
        self.inner.scheduler.cancel();
        transition(tracker, SessionState::Unauthenticated);
    }

    fn arm_scheduler(&self, access_token: &str) -> Schedule {
        let session = Arc::downgrade(&self.inner);
        self.inner.scheduler.schedule(access_token, async move {
            if let Some(inner) = session.upgrade() {
                tracing::debug!("Proactive refresh firing");
                let _ = SessionManager { inner }.refresh().await;
            }
        })
    }

    fn arm_after_refresh(&self, access_token: &str) {
        // A token issued already inside the window would re-trigger itself
        // forever; leave renewal to the request gate instead
        if self.inner.scheduler.delay_for(access_token).is_none() {
            self.inner.scheduler.cancel();
            tracing::warn!(
                "Refreshed token lifetime is shorter than the refresh buffer; renewing on demand"
            );
            return;
        }
        self.arm_scheduler(access_token);
    }

    /// `ensure_fresh` as a boolean
    pub async fn is_authenticated(&self) -> bool {
        self.ensure_fresh().await.is_authenticated()
    }

    /// Local snapshot for diagnostics; never touches the network
    pub fn auth_status(&self) -> AuthStatus {
        let now = Utc::now();
        let store = &self.inner.store;
        let access_token = store
            .get(TokenKind::Access)
            .filter(|t| codec::is_structurally_valid(t));
        let token = access_token.as_deref();

        let expires_at = token.and_then(codec::expiry);
        let next_refresh_at = self.inner.scheduler.next_refresh_at();

        AuthStatus {
            authenticated: token.is_some_and(|t| !codec::is_expired(t, Duration::zero())),
            state: self.state(),
            subject: token.and_then(codec::subject),
            username: store.username(),
            expires_at,
            expires_in: expires_at.map(|exp| (exp - now).max(Duration::zero())),
            next_refresh_at,
            next_refresh_in: next_refresh_at.map(|at| (at - now).max(Duration::zero())),
            refresh_in_flight: self.refresh_in_flight(),
        }
    }

    /// Cancel the refresh timer and drop every observer
    pub fn shutdown(&self) {
        self.inner.scheduler.cancel();
        self.inner.notifier.clear();
        tracing::info!("Session manager shut down");
    }
}

fn transition(tracker: &mut Tracker, next: SessionState) {
    if tracker.state != next {
        tracing::debug!(from = ?tracker.state, to = ?next, "Session state change");
        tracker.state = next;
    }
}
