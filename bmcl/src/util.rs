//! Misc utilities.

use std::future::Future;

use tokio::task;

/// Runs a future when dropped.
///
/// This is used to clean up external resources that are
/// difficult to correctly model using ownerships, such as
/// half-finished multipart uploads.
pub struct Finally<F: Future + Send + 'static>
where
    F::Output: Send + 'static,
{
    f: Option<F>,
}

impl<F: Future + Send + 'static> Finally<F>
where
    F::Output: Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self { f: Some(f) }
    }

    /// Disarms the cleanup.
    pub fn cancel(mut self) {
        self.f.take();
    }
}

impl<F: Future + Send + 'static> Drop for Finally<F>
where
    F::Output: Send + 'static,
{
    fn drop(&mut self) {
        if let Some(f) = self.f.take() {
            task::spawn(f);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_finally_runs_on_drop() {
        let ran = Arc::new(AtomicBool::new(false));
        let (tx, rx) = tokio::sync::oneshot::channel();

        {
            let ran = ran.clone();
            let _guard = Finally::new(async move {
                ran.store(true, Ordering::SeqCst);
                let _ = tx.send(());
            });
        }

        rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_finally_cancel() {
        let ran = Arc::new(AtomicBool::new(false));

        let guard = Finally::new({
            let ran = ran.clone();
            async move {
                ran.store(true, Ordering::SeqCst);
            }
        });
        guard.cancel();

        tokio::task::yield_now().await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
