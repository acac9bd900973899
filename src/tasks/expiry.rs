use log::debug;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

type TimerMap = HashMap<String, (u64, JoinHandle<()>)>;
type Timers = Arc<Mutex<TimerMap>>;

/// One-shot timer per poll.
///
/// Timers are a prompt-notification optimization only: the lifecycle manager
/// also ends polls lazily from timestamps, so losing a timer (restart, abort)
/// never affects correctness.
#[derive(Debug, Default)]
pub struct ExpiryScheduler {
    timers: Timers,
    generation: AtomicU64,
}

impl ExpiryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn timers(timers: &Timers) -> MutexGuard<'_, TimerMap> {
        timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `on_fire` once after `delay`. Arming an id that already has a
    /// pending timer replaces it.
    pub fn arm<F, Fut>(&self, poll_id: &str, delay: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);
        let id = poll_id.to_string();

        // Hold the map lock across spawn so the task cannot deregister
        // before its own handle is inserted
        let mut map = Self::timers(&self.timers);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            // Deregister before firing; a later cancel() must not abort the callback
            {
                let mut map = Self::timers(&timers);
                if map.get(&id).is_some_and(|(g, _)| *g == generation) {
                    map.remove(&id);
                }
            }
            debug!("Expiry timer fired for poll {}", id);
            on_fire().await;
        });

        if let Some((_, previous)) = map.insert(poll_id.to_string(), (generation, handle)) {
            previous.abort();
        }
    }

    /// Abort a pending timer. Returns false if none was pending.
    pub fn cancel(&self, poll_id: &str) -> bool {
        match Self::timers(&self.timers).remove(poll_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, poll_id: &str) -> bool {
        Self::timers(&self.timers).contains_key(poll_id)
    }

    pub fn pending(&self) -> usize {
        Self::timers(&self.timers).len()
    }
}

impl Drop for ExpiryScheduler {
    fn drop(&mut self) {
        for (_, (_, handle)) in Self::timers(&self.timers).drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() -> std::future::Ready<()> + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let hit = Arc::clone(&fired);
        (fired, move || {
            hit.fetch_add(1, Ordering::SeqCst);
            std::future::ready(())
        })
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_delay() {
        let scheduler = ExpiryScheduler::new();
        let (fired, on_fire) = counter();
        scheduler.arm("p", Duration::from_secs(60), on_fire);
        assert!(scheduler.is_armed("p"));

        tokio::time::sleep(Duration::from_secs(59)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_armed("p"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_firing() {
        let scheduler = ExpiryScheduler::new();
        let (fired, on_fire) = counter();
        scheduler.arm("p", Duration::from_secs(5), on_fire);
        assert!(scheduler.cancel("p"));
        assert!(!scheduler.cancel("p"));

        tokio::time::sleep(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_replaces_the_pending_timer() {
        let scheduler = ExpiryScheduler::new();
        let (first, on_first) = counter();
        let (second, on_second) = counter();
        scheduler.arm("p", Duration::from_secs(5), on_first);
        scheduler.arm("p", Duration::from_secs(20), on_second);
        assert_eq!(scheduler.pending(), 1);

        tokio::time::sleep(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending(), 0);
    }
}
