use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::approvals::{ApprovalService, TimeoutOutcome};
use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::errors::ApplicationError;
use crate::store::TimerStore;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub batch_size: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_backoff: Duration::from_secs(600),
            batch_size: 100,
        }
    }
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_backoff: config.max_backoff(),
            batch_size: config.batch_size,
        }
    }
}

impl SchedulerSettings {
    /// Poll interval doubled per consecutive failing sweep, capped at `max_backoff`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let multiplier = 1_u32 << failures.min(16);
        self.poll_interval.saturating_mul(multiplier).min(self.max_backoff)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub due: usize,
    pub approved: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// What the background loop last saw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SweepStatus {
    pub last_sweep_at: Option<DateTime<Utc>>,
    pub last_report: Option<SweepReport>,
    pub consecutive_failures: u32,
}

/// Fires persisted step deadlines. Deadlines are compared against stored
/// fire times, so anything that came due while the process was down is
/// picked up on the first sweep.
pub struct TimeoutScheduler {
    service: Arc<ApprovalService>,
    timers: Arc<dyn TimerStore>,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    status: RwLock<SweepStatus>,
}

impl TimeoutScheduler {
    pub fn new(
        service: Arc<ApprovalService>,
        timers: Arc<dyn TimerStore>,
        clock: Arc<dyn Clock>,
        settings: SchedulerSettings,
    ) -> Self {
        Self { service, timers, clock, settings, status: RwLock::default() }
    }

    pub fn status(&self) -> SweepStatus {
        match self.status.read() {
            Ok(status) => *status,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Deadlines already due, capped at one sweep's batch size.
    pub async fn backlog(&self) -> Result<usize, ApplicationError> {
        Ok(self.timers.due_timers(self.clock.now(), self.settings.batch_size).await?.len())
    }

    fn record_sweep(&self, at: DateTime<Utc>, report: Option<SweepReport>, failures: u32) {
        let mut status = match self.status.write() {
            Ok(status) => status,
            Err(poisoned) => poisoned.into_inner(),
        };
        let last_report = report.or(status.last_report);
        *status = SweepStatus { last_sweep_at: Some(at), last_report, consecutive_failures: failures };
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<SweepReport, ApplicationError> {
        let due = self.timers.due_timers(now, self.settings.batch_size).await?;
        let mut report = SweepReport { due: due.len(), ..SweepReport::default() };

        for timer in due {
            match self.service.fire_timeout(&timer.step_id).await {
                Ok(TimeoutOutcome::AutoApproved) => {
                    report.approved += 1;
                    info!(
                        event_name = "approval.timeout.fired",
                        correlation_id = %timer.request_id.0,
                        request_id = %timer.request_id.0,
                        step_id = %timer.step_id.0,
                        fire_at = %timer.fire_at.to_rfc3339(),
                        "step auto-approved after deadline"
                    );
                }
                Ok(TimeoutOutcome::Stale) => {
                    report.skipped += 1;
                    debug!(
                        event_name = "approval.timeout.stale",
                        correlation_id = %timer.request_id.0,
                        step_id = %timer.step_id.0,
                        "deadline fired for a step that is no longer active"
                    );
                }
                Err(error) => {
                    report.failed += 1;
                    warn!(
                        event_name = "approval.timeout.failed",
                        correlation_id = %timer.request_id.0,
                        request_id = %timer.request_id.0,
                        step_id = %timer.step_id.0,
                        attempts = timer.attempts.saturating_add(1),
                        error = %error,
                        "timeout transition failed; will retry"
                    );
                    if let Err(record_error) =
                        self.timers.record_timer_failure(&timer.step_id, &error.to_string()).await
                    {
                        warn!(
                            event_name = "approval.timeout.failure_not_recorded",
                            correlation_id = %timer.request_id.0,
                            step_id = %timer.step_id.0,
                            error = %record_error,
                            "could not persist timer failure"
                        );
                    }
                }
            }
        }

        Ok(report)
    }

    /// Sweeps until `shutdown` flips to `true` or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            event_name = "scheduler.started",
            poll_interval_ms = self.settings.poll_interval.as_millis() as u64,
            batch_size = self.settings.batch_size,
            "timeout scheduler started"
        );

        let mut failures: u32 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            let started_at = self.clock.now();
            let result = self.run_once(started_at).await;
            match &result {
                Ok(report) if report.failed == 0 => {
                    failures = 0;
                    if report.due > 0 {
                        info!(
                            event_name = "scheduler.sweep.completed",
                            due = report.due,
                            approved = report.approved,
                            skipped = report.skipped,
                            "timeout sweep completed"
                        );
                    }
                }
                Ok(report) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        event_name = "scheduler.sweep.partial",
                        due = report.due,
                        failed = report.failed,
                        consecutive_failures = failures,
                        "timeout sweep had failures"
                    );
                }
                Err(error) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        event_name = "scheduler.sweep.failed",
                        consecutive_failures = failures,
                        error = %error,
                        "timeout sweep failed"
                    );
                }
            }
            self.record_sweep(started_at, result.ok(), failures);

            let delay = self.settings.backoff(failures);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        info!(event_name = "scheduler.stopped", "timeout scheduler stopped");
    }
}
