// Single-flight execution
// Concurrent callers share one running future instead of starting their own.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type Flight<T> = Shared<BoxFuture<'static, Option<T>>>;

/// Slot holding either nothing or the in-progress work plus its waiters.
///
/// The work runs on its own task, so it completes even if every waiter is
/// dropped. The slot is vacated before any waiter sees the result.
pub struct SingleFlight<T> {
    slot: Arc<Mutex<Option<(u64, Flight<T>)>>>,
    next_id: AtomicU64,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Join the running flight, or start `work` if none is running.
    ///
    /// Returns `None` only if the work task panicked or was aborted.
    pub async fn run<F, Fut>(&self, work: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let flight = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            match slot.as_ref() {
                Some((_, flight)) => {
                    tracing::debug!("Joining in-flight operation");
                    flight.clone()
                }
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    let flight = self.launch(id, work());
                    *slot = Some((id, flight.clone()));
                    flight
                }
            }
        };

        flight.await
    }

    fn launch<Fut>(&self, id: u64, work: Fut) -> Flight<T>
    where
        Fut: Future<Output = T> + Send + 'static,
    {
        let slot = Arc::clone(&self.slot);
        let task_slot = Arc::clone(&self.slot);

        let handle = tokio::spawn(async move {
            let output = work.await;
            release(&task_slot, id);
            output
        });

        async move {
            let output = handle.await.ok();
            if output.is_none() {
                // Panicked or aborted before releasing the slot itself
                release(&slot, id);
            }
            output
        }
        .boxed()
        .shared()
    }
}

fn release<T>(slot: &Mutex<Option<(u64, T)>>, id: u64) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.as_ref().is_some_and(|(current, _)| *current == id) {
        slot.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_execution() {
        let flight = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        let call = || {
            let runs = runs.clone();
            flight.run(move || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                42u32
            })
        };

        let (a, b, c) = tokio::join!(call(), call(), call());

        assert_eq!((a, b, c), (Some(42), Some(42), Some(42)));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!flight.in_flight());
    }

    #[tokio::test]
    async fn test_waiter_pending_until_work_completes() {
        let flight = SingleFlight::new();
        let (tx, rx) = tokio::sync::oneshot::channel::<u8>();

        let mut waiter =
            tokio_test::task::spawn(flight.run(move || async move { rx.await.unwrap_or(0) }));
        tokio_test::assert_pending!(waiter.poll());
        assert!(flight.in_flight());

        tx.send(5).unwrap();
        assert_eq!(waiter.await, Some(5));
        assert!(!flight.in_flight());
    }

    #[tokio::test]
    async fn test_sequential_calls_run_again() {
        let flight = SingleFlight::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for expected in 1..=2 {
            let counter = runs.clone();
            let out = flight
                .run(move || async move { counter.fetch_add(1, Ordering::SeqCst) + 1 })
                .await;
            assert_eq!(out, Some(expected));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_panicking_work_releases_slot() {
        let flight: SingleFlight<u32> = SingleFlight::new();

        let out = flight
            .run(|| async {
                if true {
                    panic!("work failed");
                }
                0
            })
            .await;

        assert_eq!(out, None);
        assert!(!flight.in_flight());
        assert_eq!(flight.run(|| async { 7 }).await, Some(7));
    }

    #[tokio::test]
    async fn test_work_survives_dropped_waiter() {
        let flight = Arc::new(SingleFlight::new());
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let done = Arc::new(AtomicUsize::new(0));

        let counter = done.clone();
        let waiter = {
            let flight = flight.clone();
            tokio::spawn(async move {
                flight
                    .run(move || async move {
                        let _ = rx.await;
                        counter.fetch_add(1, Ordering::SeqCst);
                        1u8
                    })
                    .await
            })
        };

        while !flight.in_flight() {
            tokio::task::yield_now().await;
        }
        waiter.abort();
        let _ = tx.send(());

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert!(!flight.in_flight());
    }
}
