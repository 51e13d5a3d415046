use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Ok => write!(f, "ok"),
            HealthStatus::Degraded => write!(f, "degraded"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub response_scheduler: HealthStatus,
    pub thread_manager: HealthStatus,
    pub scheduler_running: bool,
    pub last_tick: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct TickState {
    last_tick: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// Liveness bookkeeping for the dispatcher and the thread materializer.
#[derive(Debug)]
pub struct HealthMonitor {
    poll_interval: Duration,
    running: AtomicBool,
    tick: Mutex<TickState>,
    commit_errors: AtomicU64,
}

impl HealthMonitor {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval,
            running: AtomicBool::new(false),
            tick: Mutex::new(TickState::default()),
            commit_errors: AtomicU64::new(0),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn record_tick(&self, at: DateTime<Utc>, error: Option<String>) {
        let mut tick = self.tick.lock();
        tick.last_tick = Some(at);
        tick.last_error = error;
    }

    pub fn record_commit(&self, ok: bool) {
        if ok {
            self.commit_errors.store(0, Ordering::SeqCst);
        } else {
            self.commit_errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Scheduler is degraded when its last tick failed, or when it is supposed
    /// to be running but has missed three polls in a row.
    pub fn report(&self, now: DateTime<Utc>, store_ok: bool) -> HealthReport {
        let running = self.running.load(Ordering::SeqCst);
        let tick = self.tick.lock();

        let stalled = running
            && tick
                .last_tick
                .map_or(false, |t| now - t > self.poll_interval * 3);
        let response_scheduler = if tick.last_error.is_some() || stalled || !store_ok {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };

        let thread_manager = if self.commit_errors.load(Ordering::SeqCst) > 0 || !store_ok {
            HealthStatus::Degraded
        } else {
            HealthStatus::Ok
        };

        HealthReport {
            response_scheduler,
            thread_manager,
            scheduler_running: running,
            last_tick: tick.last_tick,
            last_error: tick.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_monitor_is_ok() {
        let monitor = HealthMonitor::new(Duration::seconds(30));
        let report = monitor.report(Utc::now(), true);
        assert_eq!(report.response_scheduler, HealthStatus::Ok);
        assert_eq!(report.thread_manager, HealthStatus::Ok);
    }

    #[test]
    fn test_stalled_scheduler_is_degraded() {
        let monitor = HealthMonitor::new(Duration::seconds(30));
        let start = Utc::now();
        monitor.set_running(true);
        monitor.record_tick(start, None);

        assert_eq!(
            monitor.report(start + Duration::seconds(60), true).response_scheduler,
            HealthStatus::Ok
        );
        assert_eq!(
            monitor.report(start + Duration::seconds(120), true).response_scheduler,
            HealthStatus::Degraded
        );
    }

    #[test]
    fn test_commit_errors_degrade_thread_manager_until_success() {
        let monitor = HealthMonitor::new(Duration::seconds(30));
        monitor.record_commit(false);
        assert_eq!(monitor.report(Utc::now(), true).thread_manager, HealthStatus::Degraded);
        monitor.record_commit(true);
        assert_eq!(monitor.report(Utc::now(), true).thread_manager, HealthStatus::Ok);
    }
}
