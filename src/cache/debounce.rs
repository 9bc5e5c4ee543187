//! Cancellable delayed-task scheduling for debounced refreshes.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Runs at most one pending delayed task; scheduling again cancels the
/// previous timer and restarts the window.
///
/// The delay uses the tokio clock, so tests drive it deterministically with
/// `tokio::time::pause`.
#[derive(Debug, Default)]
pub(crate) struct Debouncer {
    pending: Mutex<Option<CancellationToken>>,
}

impl Debouncer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` to run after `delay`, cancelling any pending run.
    pub fn schedule<F>(&self, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let previous = {
            let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            slot.replace(token.clone())
        };
        if let Some(previous) = previous {
            previous.cancel();
        }

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => task.await,
            }
        });
    }

    /// Cancel any pending run.
    pub fn cancel(&self) {
        let previous = {
            let mut slot = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_burst_collapses_to_one_run() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let runs = Arc::clone(&runs);
            debouncer.schedule(Duration::from_millis(100), async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::advance(Duration::from_millis(40)).await;
        }

        // Each reschedule restarted the window, so nothing has run yet.
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(120)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_run() {
        let debouncer = Debouncer::new();
        let runs = Arc::new(AtomicUsize::new(0));

        {
            let runs = Arc::clone(&runs);
            debouncer.schedule(Duration::from_millis(50), async move {
                runs.fetch_add(1, Ordering::SeqCst);
            });
        }
        debouncer.cancel();

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
