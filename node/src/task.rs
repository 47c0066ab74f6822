//! Task groups.
//!
//! Every long-running activity of the node runs inside a [`TaskGroup`].
//! Shutting a group down cancels every task it owns, including the
//! tasks of its child groups.

use std::future::Future;
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A group of tasks sharing a lifetime.
#[derive(Debug, Clone, Default)]
pub struct TaskGroup {
    token: CancellationToken,
    tracker: TaskTracker,
}

/// A handle to a scheduled task.
///
/// Dropping the handle does not cancel the task.
#[derive(Debug, Clone)]
pub struct ScheduledTask {
    token: CancellationToken,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a group that is shut down together with this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    /// Returns whether the group has been shut down.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Waits until the group is shut down.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Spawns a task bound to this group.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    /// Runs `f` once after `delay`.
    pub fn schedule_once<F, Fut>(&self, delay: Duration, f: F) -> ScheduledTask
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let handle = ScheduledTask {
            token: token.clone(),
        };

        self.tracker.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = async {
                    time::sleep(delay).await;
                    f().await;
                } => {}
            }
        });

        handle
    }

    /// Runs `f` every `every`, starting after the first period.
    ///
    /// A run that takes longer than the period delays the next one.
    pub fn schedule_repeat<F, Fut>(&self, every: Duration, mut f: F) -> ScheduledTask
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let handle = ScheduledTask {
            token: token.clone(),
        };

        self.tracker.spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + every, every);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => f().await,
                }
            }
        });

        handle
    }

    /// Cancels every task and waits for them to finish.
    pub async fn shutdown(&self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl ScheduledTask {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_schedule_once() {
        let group = TaskGroup::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        group.schedule_once(Duration::from_secs(10), move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });

        time::sleep(Duration::from_secs(9)).await;
        assert_eq!(0, count.load(Ordering::SeqCst));

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(1, count.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_once_cancel() {
        let group = TaskGroup::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let task = group.schedule_once(Duration::from_secs(10), move || async move {
            c.fetch_add(1, Ordering::SeqCst);
        });
        task.cancel();

        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(0, count.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_repeat_and_shutdown() {
        let group = TaskGroup::new();
        let child = group.child();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        child.schedule_repeat(Duration::from_secs(60), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        time::sleep(Duration::from_secs(185)).await;
        assert_eq!(3, count.load(Ordering::SeqCst));

        group.shutdown().await;
        assert!(child.is_cancelled());

        time::sleep(Duration::from_secs(600)).await;
        assert_eq!(3, count.load(Ordering::SeqCst));
    }
}
