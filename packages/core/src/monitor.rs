//! Background task running the reconciler on a fixed interval.
//!
//! The task owns the [`Reconciler`]. Each tick runs on the blocking pool and is
//! awaited to completion, so shutdown is only observed between ticks and never
//! interrupts a mount or unmount. After every tick that changed something, an
//! owned copy of the mapping is published on a `watch` channel; readers never
//! see the live mapping.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::executor::Host;
use crate::reconcile::{Reconciler, Snapshot};

/// Handle to a running monitor task.
#[derive(Debug)]
pub struct MonitorHandle<H> {
    snapshot_rx: watch::Receiver<Snapshot>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<Reconciler<H>>>,
}

impl<H> MonitorHandle<H> {
    /// Returns a consistent copy of the devices currently managed.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// Subscribes to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.snapshot_rx.clone()
    }

    /// Stops the loop after the current tick and returns the reconciler.
    pub async fn shutdown(self) -> Result<Reconciler<H>> {
        self.shutdown_tx.send_replace(true);
        self.task.await.map_err(|e| Error::Monitor {
            message: e.to_string(),
        })?
    }
}

/// Spawns the monitor on the current tokio runtime.
pub fn spawn<H>(reconciler: Reconciler<H>, period: Duration) -> MonitorHandle<H>
where
    H: Host + Send + 'static,
{
    let (snapshot_tx, snapshot_rx) = watch::channel(reconciler.snapshot());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run(reconciler, period, snapshot_tx, shutdown_rx));

    MonitorHandle {
        snapshot_rx,
        shutdown_tx,
        task,
    }
}

async fn run<H>(
    mut reconciler: Reconciler<H>,
    period: Duration,
    snapshot_tx: watch::Sender<Snapshot>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<Reconciler<H>>
where
    H: Host + Send + 'static,
{
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(interval = ?period, "USB monitor started");

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                // A dropped handle also stops the loop
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }

            _ = ticker.tick() => {
                let (returned, report) = task::spawn_blocking(move || {
                    let report = reconciler.tick();
                    (reconciler, report)
                })
                .await
                .map_err(|e| Error::Monitor {
                    message: e.to_string(),
                })?;
                reconciler = returned;

                if report.changed() {
                    debug!(
                        mounted = ?report.mounted,
                        removed = ?report.removed,
                        "managed devices changed"
                    );
                    snapshot_tx.send_replace(reconciler.snapshot());
                }
            }
        }
    }

    info!("USB monitor stopped");
    Ok(reconciler)
}
