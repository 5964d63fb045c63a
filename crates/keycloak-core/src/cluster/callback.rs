//! Two-stage completion signal for a cluster-wide task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::{BoxFuture, Shared};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

/// How long [`TaskCallback::get_future`] waits for the result handle.
pub const LATCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Cloneable handle resolving to the task's success flag.
pub type TaskHandle = Shared<BoxFuture<'static, bool>>;

/// Callback shared by every local waiter of one cluster task.
///
/// The handle becomes available once, when the task is started here or a
/// waiter for a remote execution is set up. Completion is signalled
/// separately, either by the local execution or by a completion event from
/// the node that ran it.
pub struct TaskCallback {
    success: AtomicBool,
    handle: watch::Sender<Option<TaskHandle>>,
    completed: watch::Sender<bool>,
    latch_timeout: Duration,
}

impl TaskCallback {
    pub fn new() -> Self {
        Self::with_latch_timeout(LATCH_TIMEOUT)
    }

    pub fn with_latch_timeout(latch_timeout: Duration) -> Self {
        let (handle, _) = watch::channel(None);
        let (completed, _) = watch::channel(false);
        Self {
            success: AtomicBool::new(false),
            handle,
            completed,
            latch_timeout,
        }
    }

    pub fn set_success(&self, success: bool) {
        self.success.store(success, Ordering::SeqCst);
    }

    pub fn is_success(&self) -> bool {
        self.success.load(Ordering::SeqCst)
    }

    /// Publishes the result handle. Only the first call has an effect.
    ///
    /// Returns whether this call set the handle.
    pub fn set_future(&self, future: TaskHandle) -> bool {
        self.handle.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(future);
            true
        })
    }

    pub fn has_future(&self) -> bool {
        self.handle.borrow().is_some()
    }

    /// Waits up to the latch timeout for the result handle.
    ///
    /// `None` means the outcome is unknown, not that the task failed.
    pub async fn get_future(&self) -> Option<TaskHandle> {
        let mut rx = self.handle.subscribe();
        let arrived = timeout(self.latch_timeout, rx.wait_for(Option::is_some))
            .await
            .map(|r| r.is_ok());
        match arrived {
            Ok(true) => {}
            Ok(false) => debug!("Task callback dropped while waiting for the result handle"),
            Err(_) => debug!(
                timeout_ms = self.latch_timeout.as_millis() as u64,
                "Timed out waiting for the task result handle"
            ),
        }
        self.handle.borrow().clone()
    }

    /// Signals that the task finished, wherever it ran.
    pub fn mark_completed(&self) {
        self.completed.send_replace(true);
    }

    pub fn is_completed(&self) -> bool {
        *self.completed.borrow()
    }

    /// Waits for the completion signal. Returns `false` on timeout.
    pub async fn await_completed(&self, wait: Duration) -> bool {
        let mut rx = self.completed.subscribe();
        timeout(wait, rx.wait_for(|done| *done))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

impl Default for TaskCallback {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskCallback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskCallback")
            .field("success", &self.is_success())
            .field("completed", &self.is_completed())
            .field("latch_timeout", &self.latch_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::FutureExt;
    use std::sync::Arc;

    fn ready(value: bool) -> TaskHandle {
        async move { value }.boxed().shared()
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_future_times_out_with_none() {
        let callback = TaskCallback::new();
        let started = tokio::time::Instant::now();
        assert!(callback.get_future().await.is_none());
        assert!(started.elapsed() >= LATCH_TIMEOUT);
    }

    #[tokio::test]
    async fn test_future_set_once() {
        let callback = TaskCallback::new();
        assert!(callback.set_future(ready(true)));
        assert!(!callback.set_future(ready(false)));

        let handle = callback.get_future().await.unwrap();
        assert!(handle.await);
    }

    #[tokio::test]
    async fn test_waiter_wakes_when_future_published() {
        let callback = Arc::new(TaskCallback::new());
        let waiter = {
            let callback = Arc::clone(&callback);
            tokio::spawn(async move { callback.get_future().await })
        };
        tokio::task::yield_now().await;
        callback.set_future(ready(true));

        let handle = waiter.await.unwrap().unwrap();
        assert!(handle.await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_signal() {
        let callback = Arc::new(TaskCallback::new());
        assert!(!callback.await_completed(Duration::from_secs(1)).await);

        let waiter = {
            let callback = Arc::clone(&callback);
            tokio::spawn(async move { callback.await_completed(Duration::from_secs(30)).await })
        };
        callback.set_success(true);
        callback.mark_completed();
        assert!(waiter.await.unwrap());
        assert!(callback.is_success());
        assert!(callback.is_completed());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_state_intact() {
        let callback = Arc::new(TaskCallback::new());
        let waiter = {
            let callback = Arc::clone(&callback);
            tokio::spawn(async move { callback.get_future().await })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        assert!(callback.set_future(ready(true)));
        assert!(callback.get_future().await.is_some());
    }
}
