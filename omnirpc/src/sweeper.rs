use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::{
    sync::watch,
    task::AbortHandle,
    time::{Instant, MissedTickBehavior},
};

use crate::{Ledger, TaskSupervisor};

/// Cadence of the expiry sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Background reaper for requests that can no longer succeed.
///
/// The sweeper runs only while the ledger holds requests: it is started when
/// a request is enqueued (or the transport closes with requests pending) and
/// stops on the first tick, or the first in-band resolution, that leaves the
/// ledger empty. Timeout detection therefore lags the deadline by at most one
/// [`SWEEP_INTERVAL`].
pub struct Sweeper {
    ledger: Arc<Ledger>,
    active: watch::Receiver<bool>,
    timeout: Duration,
    handle: Mutex<Option<AbortHandle>>,
}

impl Sweeper {
    #[must_use]
    pub fn new(ledger: Arc<Ledger>, active: watch::Receiver<bool>, timeout: Duration) -> Self {
        Self {
            ledger,
            active,
            timeout,
            handle: Mutex::default(),
        }
    }

    /// Starts the sweep loop unless it is already running or there is nothing
    /// to sweep.
    pub fn ensure_running(self: &Arc<Self>, supervisor: &TaskSupervisor) {
        let mut handle = self.handle.lock();
        if handle.is_some() || self.ledger.is_empty() || supervisor.is_stopped() {
            return;
        }

        tracing::debug!("start expiry sweeper, {} pending", self.ledger.len());
        let this = self.clone();
        let task = supervisor.spawn(async move { this.run().await });
        *handle = Some(task.abort_handle());
    }

    /// Stops the sweep loop if the ledger is empty.
    pub fn stop_if_idle(&self) {
        let mut handle = self.handle.lock();
        if self.ledger.is_empty()
            && let Some(task) = handle.take()
        {
            tracing::debug!("stop expiry sweeper");
            task.abort();
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    async fn run(&self) {
        let start = Instant::now() + SWEEP_INTERVAL;
        let mut interval = tokio::time::interval_at(start, SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if self.finish_if_idle() {
                return;
            }

            let is_active = *self.active.borrow();
            let resolved = self
                .ledger
                .sweep_expired(Instant::now(), is_active, self.timeout);
            tracing::debug!(
                "sweep resolved {resolved} requests, {} still pending",
                self.ledger.len()
            );

            if self.finish_if_idle() {
                return;
            }
        }
    }

    // Checked under the handle lock so a concurrent `ensure_running` either
    // sees this loop still registered or starts a fresh one.
    fn finish_if_idle(&self) -> bool {
        let mut handle = self.handle.lock();
        if self.ledger.is_empty() {
            *handle = None;
            true
        } else {
            false
        }
    }
}

impl std::fmt::Debug for Sweeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sweeper")
            .field("timeout", &self.timeout)
            .field("running", &self.is_running())
            .finish()
    }
}
