use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agentick_core::{Scheduler, SyncEvent, TimerToken};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

type TimerTable = Arc<Mutex<HashMap<TimerToken, AbortHandle>>>;

/// Tokio-backed timers delivered to the engine as `SyncEvent::TimerFired`.
pub struct TokioScheduler {
    runtime: Handle,
    events: mpsc::UnboundedSender<SyncEvent>,
    next_token: AtomicU64,
    timers: TimerTable,
}

impl TokioScheduler {
    pub fn new(runtime: Handle, events: mpsc::UnboundedSender<SyncEvent>) -> Self {
        Self {
            runtime,
            events,
            next_token: AtomicU64::new(1),
            timers: Arc::default(),
        }
    }

    pub fn pending(&self) -> usize {
        lock(&self.timers).len()
    }
}

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration) -> TimerToken {
        let token = TimerToken::new(self.next_token.fetch_add(1, Ordering::Relaxed));
        let events = self.events.clone();
        let timers = self.timers.clone();

        // Hold the table lock across spawn so a zero delay cannot fire before registration.
        let mut table = lock(&self.timers);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            lock(&timers).remove(&token);
            if events.send(SyncEvent::TimerFired(token)).is_err() {
                tracing::debug!(token = %token, "timer fired after the driver stopped");
            }
        });
        table.insert(token, task.abort_handle());

        tracing::debug!(token = %token, delay_ms = delay.as_millis() as u64, "timer scheduled");
        token
    }

    fn cancel(&self, token: TimerToken) {
        if let Some(task) = lock(&self.timers).remove(&token) {
            task.abort();
            tracing::debug!(token = %token, "timer cancelled");
        }
    }
}

impl Drop for TokioScheduler {
    fn drop(&mut self) {
        for (_, task) in lock(&self.timers).drain() {
            task.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
