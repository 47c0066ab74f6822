//! Gates.

use tokio::sync::watch;

/// A binary lock whose holders do not need to be the ones releasing it.
///
/// Waiters block while the lock is held. Unlike a mutex, acquiring an
/// already acquired lock does not wait; the lock is a gate that other
/// tasks observe.
#[derive(Debug, Clone)]
pub struct CustomLock {
    locked: watch::Sender<bool>,
}

impl CustomLock {
    pub fn new(locked: bool) -> Self {
        Self {
            locked: watch::Sender::new(locked),
        }
    }

    pub fn acquire(&self) {
        self.locked.send_replace(true);
    }

    pub fn release(&self) {
        self.locked.send_replace(false);
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.borrow()
    }

    /// Waits until the lock is released.
    pub async fn wait(&self) {
        let mut rx = self.locked.subscribe();

        // The sender lives in `self`, so the channel cannot close here
        let _ = rx.wait_for(|locked| !*locked).await;
    }
}

impl Default for CustomLock {
    fn default() -> Self {
        Self::new(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use tokio::time;

    #[tokio::test(start_paused = true)]
    async fn test_wait_blocks_while_locked() {
        let lock = CustomLock::new(true);
        assert!(lock.is_locked());

        let waiter = tokio::spawn({
            let lock = lock.clone();
            async move {
                lock.wait().await;
            }
        });

        time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        lock.release();
        waiter.await.unwrap();
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_wait_unlocked() {
        let lock = CustomLock::default();
        lock.wait().await;

        lock.acquire();
        lock.acquire();
        lock.release();
        lock.wait().await;
    }
}
