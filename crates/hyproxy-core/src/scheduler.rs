//! Owner-scoped task scheduling on the tokio runtime.
//!
//! Every task belongs to an owner string so a component can cancel all of
//! its work at teardown with [`Scheduler::cancel_all`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cancellable handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    id: u64,
    owner: String,
    token: CancellationToken,
}

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct Entry {
    owner: String,
    token: CancellationToken,
}

#[derive(Default)]
struct Inner {
    tasks: Mutex<HashMap<u64, Entry>>,
    next_id: AtomicU64,
    root: CancellationToken,
}

#[derive(Clone, Default)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` now on the runtime.
    pub fn run_async<F>(&self, owner: &str, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(owner, task)
    }

    /// Run `task` once after `delay`.
    pub fn run_later<F>(&self, owner: &str, delay: Duration, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.spawn(owner, async move {
            tokio::time::sleep(delay).await;
            task.await;
        })
    }

    /// Run `task` after `delay`, then every `period` until cancelled.
    /// A run that overlaps the next tick delays it instead of bursting.
    pub fn run_repeating<F, Fut>(
        &self,
        owner: &str,
        delay: Duration,
        period: Duration,
        mut task: F,
    ) -> TaskHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.spawn(owner, async move {
            tokio::time::sleep(delay).await;
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                task().await;
            }
        })
    }

    fn spawn<F>(&self, owner: &str, task: F) -> TaskHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.inner.root.child_token();
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()).insert(
            id,
            Entry {
                owner: owner.to_string(),
                token: token.clone(),
            },
        );

        let inner = self.inner.clone();
        let guard = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = guard.cancelled() => {}
                _ = task => {}
            }
            inner.tasks.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
        });

        TaskHandle {
            id,
            owner: owner.to_string(),
            token,
        }
    }

    /// Cancel every task of `owner`. Returns how many were cancelled.
    pub fn cancel_all(&self, owner: &str) -> usize {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        let ids: Vec<u64> = tasks
            .iter()
            .filter(|(_, e)| e.owner == owner)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(entry) = tasks.remove(id) {
                entry.token.cancel();
            }
        }
        debug!(owner, cancelled = ids.len(), "scheduler tasks cancelled");
        ids.len()
    }

    /// Tasks not yet finished or cancelled.
    pub fn active_count(&self) -> usize {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| !e.token.is_cancelled())
            .count()
    }

    /// Cancel everything.
    pub fn shutdown(&self) {
        self.inner.root.cancel();
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn test_run_later_fires_once() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        scheduler.run_later("t", Duration::from_secs(5), async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        tokio::task::yield_now().await;
        assert_eq!(scheduler.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeating_until_cancelled() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();
        let handle = scheduler.run_repeating(
            "t",
            Duration::ZERO,
            Duration::from_secs(10),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all_by_owner() {
        let scheduler = Scheduler::new();
        let counter = Arc::new(AtomicU32::new(0));
        for owner in ["a", "a", "b"] {
            let c = counter.clone();
            scheduler.run_later(owner, Duration::from_secs(1), async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(scheduler.active_count(), 3);
        assert_eq!(scheduler.cancel_all("a"), 2);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_everything() {
        let scheduler = Scheduler::new();
        let handle = scheduler.run_async("t", std::future::pending());
        scheduler.shutdown();
        assert!(handle.is_cancelled());
        assert_eq!(scheduler.active_count(), 0);
    }
}
