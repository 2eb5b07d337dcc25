//! Periodic health sweep.
//!
//! The monitor is owned by whoever built the manager. Each tick runs
//! [`ConnectionManager::health_check_all`], which starts a reconnect for every
//! entry it marks unhealthy, and then waits on those through
//! [`ConnectionManager::recover_unhealthy`]. The task holds only a weak
//! reference, so it ends on its own once the manager is dropped.

use crate::db::manager::ConnectionManager;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Default interval between sweeps.
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(30);

/// Handle to a running health sweep. Dropping it stops the sweep.
#[derive(Debug)]
pub struct HealthMonitor {
    task: JoinHandle<()>,
    interval: Duration,
}

impl HealthMonitor {
    /// Start sweeping `manager` every `interval`. The first sweep runs one
    /// interval after the call.
    pub fn spawn(manager: &Arc<ConnectionManager>, interval: Duration) -> Self {
        let manager = Arc::downgrade(manager);
        let task = tokio::spawn(run(manager, interval));
        info!(interval_secs = interval.as_secs_f64(), "Health monitor started");
        Self { task, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Abort the sweep and wait for the task to wind down.
    pub async fn stop(mut self) {
        self.task.abort();
        // Cancelled is the expected outcome here
        let _ = (&mut self.task).await;
        info!("Health monitor stopped");
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(manager: Weak<ConnectionManager>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(manager) = manager.upgrade() else {
            debug!("Manager dropped; health monitor exiting");
            return;
        };
        sweep(&manager).await;
    }
}

/// One probe-then-recover pass.
pub async fn sweep(manager: &ConnectionManager) {
    let results = manager.health_check_all().await;
    let unhealthy = results.values().filter(|r| !r.connected).count();
    let skipped = results.values().filter(|r| r.skipped).count();
    debug!(
        probed = results.len(),
        unhealthy = unhealthy,
        skipped = skipped,
        "Health sweep"
    );

    let recovered = manager.recover_unhealthy().await;
    for (id, result) in &recovered {
        match result {
            Ok(()) => info!(connection_id = %id, "Recovered after failed health check"),
            Err(e) => warn!(connection_id = %id, error = %e, "Recovery failed"),
        }
    }
}
