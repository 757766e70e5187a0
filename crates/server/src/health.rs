use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use signoff_core::scheduler::{SweepStatus, TimeoutScheduler};
use signoff_db::DbPool;

use crate::bootstrap::Application;

const READY: &str = "ready";
const DEGRADED: &str = "degraded";
const DISABLED: &str = "disabled";
const STARTING: &str = "starting";

#[derive(Clone)]
pub struct HealthState {
    db_pool: DbPool,
    scheduler: Arc<TimeoutScheduler>,
    scheduler_enabled: bool,
    identity_configured: bool,
}

impl HealthState {
    pub fn new(
        db_pool: DbPool,
        scheduler: Arc<TimeoutScheduler>,
        scheduler_enabled: bool,
        identity_configured: bool,
    ) -> Self {
        Self { db_pool, scheduler, scheduler_enabled, identity_configured }
    }

    pub fn from_application(app: &Application) -> Self {
        Self::new(
            app.db_pool.clone(),
            app.scheduler.clone(),
            app.config.scheduler.enabled,
            app.config.identity.base_url.is_some(),
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    pub status: &'static str,
    pub detail: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: HealthCheck,
    pub timers: HealthCheck,
    /// Deadlines already due, capped at one sweep's batch.
    pub overdue_timers: Option<usize>,
    pub scheduler: HealthCheck,
    pub identity: HealthCheck,
    pub checked_at: String,
}

pub fn router(state: HealthState) -> Router {
    Router::new().route("/health", get(health)).with_state(state)
}

/// Ready while storage answers and the sweep loop is not failing. A disabled
/// scheduler or missing identity directory is reported but not degrading.
pub async fn health(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let database = database_check(&state.db_pool).await;
    let (timers, overdue_timers) = timer_check(&state).await;
    let scheduler = scheduler_check(state.scheduler_enabled, state.scheduler.status());
    let identity = identity_check(state.identity_configured);
    let ready = database.status == READY && timers.status == READY && scheduler.status != DEGRADED;

    let payload = HealthResponse {
        status: if ready { READY } else { DEGRADED },
        database,
        timers,
        overdue_timers,
        scheduler,
        identity,
        checked_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };

    let status_code = if ready { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status_code, Json(payload))
}

async fn database_check(pool: &DbPool) -> HealthCheck {
    match signoff_db::ping(pool).await {
        Ok(()) => HealthCheck { status: READY, detail: "database query succeeded".to_string() },
        Err(error) => {
            HealthCheck { status: DEGRADED, detail: format!("database query failed: {error}") }
        }
    }
}

async fn timer_check(state: &HealthState) -> (HealthCheck, Option<usize>) {
    match state.scheduler.backlog().await {
        Ok(0) => (HealthCheck { status: READY, detail: "no overdue deadlines".to_string() }, Some(0)),
        Ok(overdue) => {
            let detail = if state.scheduler_enabled {
                format!("{overdue} deadline(s) waiting for the next sweep")
            } else {
                format!("{overdue} deadline(s) overdue; scheduler is disabled")
            };
            (HealthCheck { status: READY, detail }, Some(overdue))
        }
        Err(error) => (
            HealthCheck { status: DEGRADED, detail: format!("timer store query failed: {error}") },
            None,
        ),
    }
}

fn scheduler_check(enabled: bool, status: SweepStatus) -> HealthCheck {
    if !enabled {
        return HealthCheck { status: DISABLED, detail: "SLA auto-approval is off".to_string() };
    }
    let Some(last_sweep_at) = status.last_sweep_at else {
        return HealthCheck { status: STARTING, detail: "no sweep has run yet".to_string() };
    };
    let at = last_sweep_at.to_rfc3339_opts(SecondsFormat::Secs, true);
    if status.consecutive_failures > 0 {
        return HealthCheck {
            status: DEGRADED,
            detail: format!("{} consecutive sweep(s) failed; last at {at}", status.consecutive_failures),
        };
    }
    let detail = match status.last_report {
        Some(report) => format!(
            "last sweep at {at}: {} due, {} approved, {} stale",
            report.due, report.approved, report.skipped
        ),
        None => format!("last sweep at {at}"),
    };
    HealthCheck { status: READY, detail }
}

fn identity_check(configured: bool) -> HealthCheck {
    if configured {
        HealthCheck { status: READY, detail: "role lookups use the identity directory".to_string() }
    } else {
        HealthCheck {
            status: DISABLED,
            detail: "identity.base_url is not set; role-based steps need administrator delegation"
                .to_string(),
        }
    }
}
