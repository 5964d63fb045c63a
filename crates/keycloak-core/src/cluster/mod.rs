//! Cluster-wide task coordination.
//!
//! A task identified by a key runs on at most one node at a time. The node
//! that wins the lock entry in the shared work cache executes it; every other
//! node can wait for the outcome through a [`TaskCallback`].

mod callback;

pub use callback::{LATCH_TIMEOUT, TaskCallback, TaskHandle};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::cache::SharedCache;
use crate::clock::{Clock, SystemClock};
use crate::error::{CoreError, Result};

/// Prefix of lock entries in the work cache.
pub const TASK_KEY_PREFIX: &str = "task::";

/// Lock entry stored while a task runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLock {
    pub node: String,
    pub acquired_at_ms: i64,
}

/// Outcome of [`ClusterTaskCoordinator::execute_if_not_executed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult<T> {
    executed: bool,
    result: Option<T>,
}

impl<T> ExecutionResult<T> {
    pub fn executed(result: T) -> Self {
        Self {
            executed: true,
            result: Some(result),
        }
    }

    pub fn not_executed() -> Self {
        Self {
            executed: false,
            result: None,
        }
    }

    pub fn is_executed(&self) -> bool {
        self.executed
    }

    pub fn result(&self) -> Option<&T> {
        self.result.as_ref()
    }

    pub fn into_result(self) -> Option<T> {
        self.result
    }
}

/// Tells the rest of the cluster that a task finished.
#[async_trait]
pub trait TaskCompletionNotifier: Send + Sync {
    async fn task_completed(&self, task_key: &str, success: bool) -> Result<()>;
}

/// Runs named tasks at most once cluster-wide.
pub struct ClusterTaskCoordinator {
    node_name: String,
    work_cache: SharedCache<TaskLock>,
    callbacks: DashMap<String, Arc<TaskCallback>>,
    latch_timeout: Duration,
    notifier: Option<Arc<dyn TaskCompletionNotifier>>,
}

impl ClusterTaskCoordinator {
    pub fn new(node_name: impl Into<String>, work_cache: SharedCache<TaskLock>) -> Self {
        Self {
            node_name: node_name.into(),
            work_cache,
            callbacks: DashMap::new(),
            latch_timeout: LATCH_TIMEOUT,
            notifier: None,
        }
    }

    pub fn with_latch_timeout(mut self, latch_timeout: Duration) -> Self {
        self.latch_timeout = latch_timeout;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn TaskCompletionNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn lock_key(task_key: &str) -> String {
        format!("{TASK_KEY_PREFIX}{task_key}")
    }

    async fn try_lock(&self, task_key: &str, window: Duration) -> Result<bool> {
        let lock = TaskLock {
            node: self.node_name.clone(),
            acquired_at_ms: SystemClock.now_millis(),
        };
        let existing = self
            .work_cache
            .put_if_absent(&Self::lock_key(task_key), lock, Some(window))
            .await?;
        match existing {
            None => {
                trace!(task = %task_key, node = %self.node_name, "Acquired task lock");
                Ok(true)
            }
            Some(held) => {
                debug!(
                    task = %task_key,
                    holder = %held.value.node,
                    "Task already running on another node"
                );
                Ok(false)
            }
        }
    }

    async fn unlock(work_cache: &SharedCache<TaskLock>, task_key: &str) {
        if let Err(e) = work_cache.remove(&Self::lock_key(task_key)).await {
            warn!(task = %task_key, error = %e, "Failed to release task lock");
        }
    }

    /// Runs `task` if no node currently holds the lock for `task_key`.
    ///
    /// The lock lives at most `window`, so a node that dies mid-task does not
    /// block the task forever.
    pub async fn execute_if_not_executed<T, F, Fut>(
        &self,
        task_key: &str,
        window: Duration,
        task: F,
    ) -> Result<ExecutionResult<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.try_lock(task_key, window).await? {
            return Ok(ExecutionResult::not_executed());
        }
        let result = task().await;
        Self::unlock(&self.work_cache, task_key).await;
        Ok(ExecutionResult::executed(result))
    }

    /// Starts `task` here if this node wins the lock, otherwise waits for the
    /// node that runs it.
    ///
    /// The returned handle resolves to the task's success flag. A waiter on a
    /// remote execution resolves to `false` if no completion arrives within
    /// `window`.
    pub async fn execute_if_not_executed_async<F, Fut>(
        self: &Arc<Self>,
        task_key: &str,
        window: Duration,
        task: F,
    ) -> Result<TaskHandle>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let callback = self.callback(task_key);

        let locked = match self.try_lock(task_key, window).await {
            Ok(locked) => locked,
            Err(e) => {
                self.callbacks
                    .remove_if(task_key, |_, cb| Arc::ptr_eq(cb, &callback) && !cb.has_future());
                return Err(e);
            }
        };

        if locked {
            let this = Arc::clone(self);
            let key = task_key.to_string();
            let cb = Arc::clone(&callback);
            let handle = async move {
                let success = task().await;
                Self::unlock(&this.work_cache, &key).await;
                this.complete(&key, &cb, success);
                if let Some(notifier) = &this.notifier
                    && let Err(e) = notifier.task_completed(&key, success).await
                {
                    warn!(task = %key, error = %e, "Failed to notify task completion");
                }
                success
            }
            .boxed()
            .shared();
            callback.set_future(handle.clone());
            tokio::spawn(handle.clone());
        } else {
            let this = Arc::clone(self);
            let key = task_key.to_string();
            let cb = Arc::clone(&callback);
            let waiter = async move {
                if cb.await_completed(window).await {
                    cb.is_success()
                } else {
                    debug!(task = %key, "No completion received within the task window");
                    this.callbacks.remove(&key);
                    false
                }
            }
            .boxed()
            .shared();
            // the window cleanup must run even if every handle is dropped
            if callback.set_future(waiter.clone()) {
                tokio::spawn(waiter);
            }
        }

        callback
            .get_future()
            .await
            .ok_or_else(|| CoreError::task(task_key, "result handle not available"))
    }

    /// Callback for `task_key`, shared by every local waiter.
    pub fn callback(&self, task_key: &str) -> Arc<TaskCallback> {
        Arc::clone(
            self.callbacks
                .entry(task_key.to_string())
                .or_insert_with(|| Arc::new(TaskCallback::with_latch_timeout(self.latch_timeout)))
                .value(),
        )
    }

    fn complete(&self, task_key: &str, callback: &TaskCallback, success: bool) {
        callback.set_success(success);
        callback.mark_completed();
        self.callbacks.remove(task_key);
    }

    /// Handles a completion reported by another node.
    pub fn on_task_completed(&self, task_key: &str, success: bool) {
        match self.callbacks.get(task_key).map(|cb| Arc::clone(cb.value())) {
            Some(callback) => {
                debug!(task = %task_key, success, "Remote task completed");
                self.complete(task_key, &callback, success);
            }
            None => trace!(task = %task_key, "No local waiters for completed task"),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }
}

impl std::fmt::Debug for ClusterTaskCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterTaskCoordinator")
            .field("node_name", &self.node_name)
            .field("pending", &self.callbacks.len())
            .finish_non_exhaustive()
    }
}
