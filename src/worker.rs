//! Periodic background tasks with cooperative shutdown

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Handle to a running periodic task.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) also
/// stops the task, but nobody waits for its final tick.
pub struct WorkerHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signal the task to stop and wait until it has exited
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!("Background task {} ended abnormally: {}", self.name, e);
        }
    }
}

/// Spawn `tick` every `period`, first run one period from now.
///
/// When `final_tick` is set, `tick` runs once more after shutdown is
/// requested so pending work is drained before the task exits. A tick in
/// progress is never cancelled.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    final_tick: bool,
    mut tick: F,
) -> WorkerHandle
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        debug!("Background task {} started, period {:?}", name, period);

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => tick().await,
                changed = shutdown_rx.changed() => {
                    // Err means every handle is gone; treat like a shutdown request
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        if final_tick {
            tick().await;
        }
        debug!("Background task {} stopped", name);
    });

    WorkerHandle {
        name,
        shutdown_tx,
        task,
    }
}
