// Proactive refresh scheduling
// A single-slot task handle: arming always cancels whatever was pending.

use chrono::{DateTime, Duration, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;

use super::codec;

/// Default lead time before expiry at which renewal fires (5 minutes)
pub const DEFAULT_REFRESH_BUFFER_SECS: u64 = 300;

struct Armed {
    id: u64,
    fire_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

/// Holds at most one pending delayed task
#[derive(Default)]
pub struct ScheduledTask {
    slot: Arc<Mutex<Option<Armed>>>,
    next_id: AtomicU64,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` after `delay`, replacing any pending task.
    /// Must be called from within a tokio runtime.
    pub fn arm<F>(&self, delay: std::time::Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let fire_at = Utc::now() + Duration::from_std(delay).unwrap_or(Duration::zero());
        let slot = Arc::clone(&self.slot);

        let mut guard = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = guard.take() {
            previous.handle.abort();
        }

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Vacate the slot before running so the task can re-arm safely
            {
                let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                if guard.as_ref().is_some_and(|armed| armed.id == id) {
                    guard.take();
                }
            }

            task.await;
        });

        *guard = Some(Armed {
            id,
            fire_at,
            handle,
        });
    }

    /// Abort the pending task, if any. Returns whether one was pending.
    pub fn cancel(&self) -> bool {
        match self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(armed) => {
                armed.handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|armed| !armed.handle.is_finished())
    }

    /// When the pending task is due
    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|armed| !armed.handle.is_finished())
            .map(|armed| armed.fire_at)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// What `RefreshScheduler::schedule` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Timer armed to fire after `delay`
    Armed {
        fire_at: DateTime<Utc>,
        delay: std::time::Duration,
    },
    /// Renewal is already due and was started right away
    Immediate,
}

/// Delay until renewal is due: `expiry - buffer - now`, or `None` when that
/// moment is not in the future or the expiry is unknown.
pub fn refresh_delay(
    expiry: Option<DateTime<Utc>>,
    buffer: Duration,
    now: DateTime<Utc>,
) -> Option<std::time::Duration> {
    let fire_at = expiry? - buffer;
    if fire_at <= now {
        return None;
    }
    (fire_at - now).to_std().ok()
}

/// Arms the proactive renewal timer for the stored access token
pub struct RefreshScheduler {
    task: ScheduledTask,
    buffer: Duration,
}

impl RefreshScheduler {
    pub fn new(buffer: Duration) -> Self {
        Self {
            task: ScheduledTask::new(),
            buffer,
        }
    }

    pub fn buffer(&self) -> Duration {
        self.buffer
    }

    /// Delay the next renewal would get for `access_token`
    pub fn delay_for(&self, access_token: &str) -> Option<std::time::Duration> {
        refresh_delay(codec::expiry(access_token), self.buffer, Utc::now())
    }

    /// Cancel the pending timer and arm a new one at `expiry - buffer`.
    /// When that moment has passed (or expiry is unknown) `on_fire` is
    /// spawned immediately and no timer is left pending.
    pub fn schedule<F>(&self, access_token: &str, on_fire: F) -> Schedule
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.delay_for(access_token) {
            Some(delay) => {
                self.task.arm(delay, on_fire);
                let fire_at = self.task.fire_at().unwrap_or_else(Utc::now);
                tracing::debug!(
                    fire_at = %fire_at.to_rfc3339(),
                    delay_secs = delay.as_secs(),
                    "Scheduled token refresh"
                );
                Schedule::Armed { fire_at, delay }
            }
            None => {
                self.task.cancel();
                tracing::debug!("Token inside refresh window; refreshing now");
                tokio::spawn(on_fire);
                Schedule::Immediate
            }
        }
    }

    pub fn cancel(&self) -> bool {
        let cancelled = self.task.cancel();
        if cancelled {
            tracing::debug!("Cancelled scheduled token refresh");
        }
        cancelled
    }

    pub fn is_armed(&self) -> bool {
        self.task.is_armed()
    }

    pub fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
        self.task.fire_at()
    }
}
