use std::future::Future;

use tokio::task::JoinHandle;
use tokio_util::{
    sync::{CancellationToken, DropGuard, WaitForCancellationFuture},
    task::TaskTracker,
};

/// Owner of the background tasks of a client or transport.
///
/// Every task spawned through the supervisor races against its stop token, so
/// [`stop`](Self::stop) (or dropping the supervisor) ends all of them at their
/// next await point.
///
/// # Examples
///
/// ```rust,no_run
/// # use omnirpc::TaskSupervisor;
/// # #[tokio::main]
/// # async fn main() {
/// let supervisor = TaskSupervisor::default();
/// supervisor.spawn(async {
///     tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
/// });
/// supervisor.stop();
/// supervisor.join().await;
/// # }
/// ```
#[derive(Debug, Default)]
pub struct TaskSupervisor {
    tracker: TaskTracker,
    stop: CancellationToken,
}

impl TaskSupervisor {
    /// Spawns `future` on the current runtime, cancelled when the supervisor stops.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let stop = self.stop.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                () = stop.cancelled() => {}
                () = future => {}
            }
        })
    }

    /// Requests all tasks to stop.
    pub fn stop(&self) {
        self.stop.cancel();
        self.tracker.close();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Returns a guard that stops the supervisor when dropped.
    #[must_use]
    pub fn drop_guard(&self) -> DropGuard {
        self.stop.clone().drop_guard()
    }

    /// Resolves once stop has been requested.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.stop.cancelled()
    }

    /// Waits for every spawned task to finish. Only returns after [`stop`](Self::stop).
    pub async fn join(&self) {
        self.tracker.wait().await;
    }

    #[must_use]
    pub fn running(&self) -> usize {
        self.tracker.len()
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}
