//! Local activation timers.
//!
//! One-shot and periodic timers delivering [`Grain::on_timer`] ticks as
//! ordinary work items on the owning activation's queue, so ticks obey
//! the same turn discipline as messages. Timers die with the activation;
//! durable wake-ups are the reminder service's job.
//!
//! [`Grain::on_timer`]: crate::grain::Grain::on_timer

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::scheduler::WorkItem;

/// Timers registered by one activation.
pub struct TimerRegistry {
    queue: mpsc::UnboundedSender<WorkItem>,
    timers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl std::fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerRegistry")
            .field("timers", &self.timers.lock().len())
            .finish()
    }
}

impl TimerRegistry {
    /// Registry feeding ticks into the given activation queue.
    pub(crate) fn new(queue: mpsc::UnboundedSender<WorkItem>) -> Self {
        Self {
            queue,
            timers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a timer. Re-registering a name replaces the old timer.
    /// `period` of `None` makes it one-shot.
    pub fn register(&self, name: String, due: Duration, period: Option<Duration>) {
        let queue = self.queue.clone();
        let tick_name = name.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(due).await;
            loop {
                if queue.send(WorkItem::Timer(tick_name.clone())).is_err() {
                    break;
                }
                match period {
                    Some(period) => tokio::time::sleep(period).await,
                    None => break,
                }
            }
        });
        if let Some(old) = self.timers.lock().insert(name, task) {
            old.abort();
        }
    }

    /// Cancel a timer by name. Unknown names are a no-op.
    pub fn cancel(&self, name: &str) {
        if let Some(task) = self.timers.lock().remove(name) {
            task.abort();
            debug!(timer = name, "timer cancelled");
        }
    }

    /// Cancel everything; called when the activation goes away.
    pub(crate) fn cancel_all(&self) {
        for (_, task) in self.timers.lock().drain() {
            task.abort();
        }
    }

    /// Number of live timers.
    pub fn len(&self) -> usize {
        self.timers.lock().len()
    }

    /// Whether no timers are registered.
    pub fn is_empty(&self) -> bool {
        self.timers.lock().is_empty()
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
