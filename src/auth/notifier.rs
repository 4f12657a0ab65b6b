// Auth-state publish/subscribe

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Auth-state change announced to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    /// A new credential pair was stored
    TokensUpdated,
    /// Local credentials were removed (logout or malformed token)
    TokensCleared,
    /// Renewal failed and the session was dropped
    RefreshFailed { reason: String },
}

impl AuthEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthEvent::TokensUpdated => "tokens_updated",
            AuthEvent::TokensCleared => "tokens_cleared",
            AuthEvent::RefreshFailed { .. } => "refresh_failed",
        }
    }
}

/// Receives auth events synchronously on the publishing task
pub trait AuthObserver: Send + Sync {
    fn on_event(&self, event: &AuthEvent);
}

impl<F> AuthObserver for F
where
    F: Fn(&AuthEvent) + Send + Sync,
{
    fn on_event(&self, event: &AuthEvent) {
        self(event)
    }
}

/// Handle returned by `subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observer registry
#[derive(Default)]
pub struct AuthNotifier {
    observers: Mutex<Vec<(SubscriptionId, Arc<dyn AuthObserver>)>>,
    next_id: AtomicU64,
}

impl AuthNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer. Registering the same `Arc` again returns its
    /// existing id instead of adding a second entry.
    pub fn subscribe(&self, observer: Arc<dyn AuthObserver>) -> SubscriptionId {
        let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some((id, _)) = observers
            .iter()
            .find(|(_, existing)| Arc::ptr_eq(existing, &observer))
        {
            return *id;
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        observers.push((id, observer));
        id
    }

    /// Remove an observer; unknown ids are ignored
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(existing, _)| *existing != id);
    }

    pub fn len(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every observer
    pub fn clear(&self) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Deliver `event` to every observer. A panicking observer is logged and
    /// skipped; delivery continues with the rest.
    pub fn publish(&self, event: AuthEvent) {
        // Snapshot so observers may (un)subscribe from inside the callback
        let observers: Vec<_> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        tracing::debug!(
            event = event.kind(),
            observers = observers.len(),
            "Publishing auth event"
        );

        for (id, observer) in observers {
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| observer.on_event(&event)));
            if delivered.is_err() {
                tracing::warn!(
                    subscription = id.0,
                    event = event.kind(),
                    "Auth observer panicked; continuing delivery"
                );
            }
        }
    }
}
