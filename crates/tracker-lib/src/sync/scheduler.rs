//! Single-slot retry timer
//!
//! At most one timer is outstanding per pipeline. Arming while a timer is
//! pending or running is a no-op; the firing task clears the slot itself
//! once its send attempt has finished, then re-arms if work remains.

use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Default)]
pub struct RetryScheduler {
    slot: Mutex<Option<JoinHandle<()>>>,
}

impl RetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `task` to run after `delay` unless a timer already exists.
    ///
    /// Returns true when a new timer was started.
    pub async fn arm<F, Fut>(&self, delay: Duration, task: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }

        debug!(delay_ms = delay.as_millis() as u64, "Arming retry timer");
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task().await;
        }));
        true
    }

    /// Release the slot from inside the firing task
    pub async fn clear(&self) {
        // Dropping the handle detaches rather than aborts the running task
        self.slot.lock().await.take();
    }

    /// Abort a pending timer, if any
    pub async fn cancel(&self) {
        if let Some(handle) = self.slot.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn is_armed(&self) -> bool {
        self.slot
            .lock()
            .await
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for RetryScheduler {
    fn drop(&mut self) {
        if let Some(handle) = self.slot.get_mut().take() {
            handle.abort();
        }
    }
}
