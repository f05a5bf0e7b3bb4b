//! Task Watchdog
//!
//! Cancels Tasks that have been running longer than a wall-clock budget.
//! The Task Manager itself has no timeouts; this is an optional policy
//! layered on top of `cancel_task`.

use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::CallerContext;
use crate::task::TaskManager;

/// Periodically cancels Tasks that exceed their time budget.
pub struct Watchdog {
    tasks: TaskManager,
    budget: Duration,
    interval: Duration,
}

impl Watchdog {
    /// Creates a watchdog that checks every `budget / 10`, clamped to
    /// between one second and one minute.
    pub fn new(tasks: TaskManager, budget: Duration) -> Self {
        let interval = (budget / 10).clamp(Duration::from_secs(1), Duration::from_secs(60));
        Self {
            tasks,
            budget,
            interval,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Cancels every Task that has been running longer than the budget.
    /// Returns the ids of the cancelled Tasks.
    pub fn sweep(&self) -> Vec<Uuid> {
        let now = Utc::now();
        let system = CallerContext::system();
        let reason = format!("exceeded time budget of {}s", self.budget.as_secs());

        let mut cancelled = Vec::new();
        for (id, started_at) in self.tasks.running_since() {
            let elapsed = (now - started_at).to_std().unwrap_or_default();
            if elapsed < self.budget {
                continue;
            }
            match self.tasks.cancel_with(&system, id, &reason) {
                Ok(_) => {
                    info!("Watchdog cancelled task {} after {}s", id, elapsed.as_secs());
                    cancelled.push(id);
                }
                Err(e) => warn!("Watchdog could not cancel task {}: {}", id, e),
            }
        }
        cancelled
    }

    /// Runs the watchdog until `shutdown` is cancelled.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Watchdog started: budget {}s, checking every {}s",
                self.budget.as_secs(),
                self.interval.as_secs()
            );
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let cancelled = self.sweep();
                        debug!("Watchdog sweep cancelled {} tasks", cancelled.len());
                    }
                }
            }
            debug!("Watchdog stopped");
        })
    }
}
