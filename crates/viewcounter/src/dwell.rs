//! Cancellable minimum-dwell countdown.
//!
//! A view only counts once the visitor has kept the page visible for the
//! whole dwell. The countdown runs as a tokio task; cancelling (or dropping
//! the timer) aborts that task, so a backgrounded page never accrues dwell
//! time behind the visitor's back.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::trace;

/// One-shot countdown that runs a callback when it completes uninterrupted.
#[derive(Debug, Default)]
pub struct DwellTimer {
    task: Option<JoinHandle<()>>,
}

impl DwellTimer {
    /// Create an idle timer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting down from `minimum_dwell`.
    ///
    /// `on_elapsed` runs exactly once if the countdown is not cancelled
    /// first. Starting an active timer cancels the running countdown.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&mut self, minimum_dwell: Duration, on_elapsed: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cancel();

        trace!(dwell_ms = minimum_dwell.as_millis(), "Dwell started");
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(minimum_dwell).await;
            on_elapsed();
        }));
    }

    /// Stop the countdown. Safe to call repeatedly and after it elapsed.
    pub fn cancel(&mut self) {
        if let Some(task) = self.task.take() {
            if !task.is_finished() {
                trace!("Dwell cancelled");
            }
            task.abort();
        }
    }

    /// Whether a countdown is pending.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for DwellTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counter() -> (Arc<AtomicUsize>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&fired);
        (fired, move || {
            handle.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_once_after_dwell() {
        let (fired, on_elapsed) = counter();
        let mut timer = DwellTimer::new();
        timer.start(Duration::from_secs(5), on_elapsed);
        assert!(timer.is_active());

        tokio::time::sleep(Duration::from_millis(4_900)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_before_elapse_prevents_callback() {
        let (fired, on_elapsed) = counter();
        let mut timer = DwellTimer::new();
        timer.start(Duration::from_secs(5), on_elapsed);

        tokio::time::sleep(Duration::from_secs(3)).await;
        timer.cancel();
        timer.cancel();

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_elapse_is_harmless() {
        let (fired, on_elapsed) = counter();
        let mut timer = DwellTimer::new();
        timer.start(Duration::from_millis(10), on_elapsed);

        tokio::time::sleep(Duration::from_secs(1)).await;
        timer.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_counts_from_zero() {
        let (fired, on_elapsed) = counter();
        let (refired, on_restart) = counter();
        let mut timer = DwellTimer::new();
        timer.start(Duration::from_secs(5), on_elapsed);

        tokio::time::sleep(Duration::from_secs(4)).await;
        timer.start(Duration::from_secs(5), on_restart);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(refired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(refired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels() {
        let (fired, on_elapsed) = counter();
        let mut timer = DwellTimer::new();
        timer.start(Duration::from_secs(5), on_elapsed);
        drop(timer);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_idle_timer() {
        let mut timer = DwellTimer::new();
        assert!(!timer.is_active());
        timer.cancel();
    }
}
