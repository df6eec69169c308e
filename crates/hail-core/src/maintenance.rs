//! Background housekeeping: the periodic schedule sweep and the load monitor.

use crate::registry::Registry;
use crate::schedule::{ScheduleStore, DEFAULT_MAX_AGE};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

/// Maintenance configuration.
#[derive(Debug, Clone)]
pub struct MaintenanceConfig {
    /// How often aged negotiation entries are swept.
    pub sweep_interval: Duration,
    /// Entries older than this are evicted by a sweep.
    pub max_age: Duration,
    /// How often counts are logged.
    pub monitor_interval: Duration,
    /// Entry count above which the monitor forces a sweep.
    pub force_sweep_threshold: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(10 * 60),
            max_age: DEFAULT_MAX_AGE,
            monitor_interval: Duration::from_secs(60),
            force_sweep_threshold: 1000,
        }
    }
}

/// Result of one monitor pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorReport {
    pub connections: usize,
    pub negotiations: usize,
    /// Entries evicted by a forced sweep, if one ran.
    pub forced_evictions: Option<usize>,
}

pub struct Maintenance {
    registry: Arc<Registry>,
    schedules: Arc<ScheduleStore>,
    config: MaintenanceConfig,
}

impl Maintenance {
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        schedules: Arc<ScheduleStore>,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            registry,
            schedules,
            config,
        }
    }

    /// Evict entries past the maximum age.
    pub fn sweep(&self) -> usize {
        let evicted = self.schedules.sweep(self.config.max_age).len();
        info!(evicted, remaining = self.schedules.len(), "Cleaned up expired schedules");
        evicted
    }

    /// Log current load and force a sweep when the store is oversized.
    pub fn monitor(&self) -> MonitorReport {
        let connections = self.registry.len();
        let negotiations = self.schedules.len();
        info!(connections, negotiations, "Engine load");

        let forced_evictions = (negotiations > self.config.force_sweep_threshold).then(|| {
            warn!(
                negotiations,
                threshold = self.config.force_sweep_threshold,
                "Too many active schedules, forcing cleanup"
            );
            self.sweep()
        });

        MonitorReport {
            connections,
            negotiations,
            forced_evictions,
        }
    }

    /// Run the sweep and the monitor on their own intervals.
    ///
    /// The tasks stop when the returned handle is dropped.
    #[must_use]
    pub fn spawn(self) -> MaintenanceHandle {
        let this = Arc::new(self);

        let sweeper = {
            let this = Arc::clone(&this);
            tokio::spawn(async move {
                let mut ticks = delayed_interval(this.config.sweep_interval);
                loop {
                    ticks.tick().await;
                    this.sweep();
                }
            })
        };

        let monitor = tokio::spawn(async move {
            let mut ticks = delayed_interval(this.config.monitor_interval);
            loop {
                ticks.tick().await;
                this.monitor();
            }
        });

        MaintenanceHandle {
            tasks: vec![sweeper, monitor],
        }
    }
}

fn delayed_interval(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Owns the background maintenance tasks.
#[derive(Debug)]
pub struct MaintenanceHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
