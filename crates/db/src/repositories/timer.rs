use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;

use signoff_core::domain::request::{RequestId, StepId};
use signoff_core::store::{ApprovalTimer, StoreError, TimerStore};

use super::{decode_ts, encode_ts, get, get_u32, RepositoryError};
use crate::DbPool;

const MAX_ERROR_LEN: usize = 512;

/// Timers are written by [`super::SqlApprovalStore::commit`]; this store only
/// reads them and handles bookkeeping for the scheduler.
pub struct SqlTimerStore {
    pool: DbPool,
}

impl SqlTimerStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn row_to_timer(row: &SqliteRow) -> Result<ApprovalTimer, RepositoryError> {
    let fire_at: String = get(row, "fire_at")?;
    let created_at: String = get(row, "created_at")?;
    Ok(ApprovalTimer {
        step_id: StepId(get(row, "step_id")?),
        request_id: RequestId(get(row, "request_id")?),
        fire_at: decode_ts(&fire_at, "fire_at")?,
        attempts: get_u32(row, "attempts")?,
        last_error: get(row, "last_error")?,
        created_at: decode_ts(&created_at, "created_at")?,
    })
}

#[async_trait]
impl TimerStore for SqlTimerStore {
    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalTimer>, StoreError> {
        let rows = sqlx::query(
            "SELECT step_id, request_id, fire_at, attempts, last_error, created_at
             FROM approval_timer
             WHERE fire_at <= ?
             ORDER BY fire_at ASC, step_id ASC
             LIMIT ?",
        )
        .bind(encode_ts(now))
        .bind(i64::from(limit.max(1)))
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(row_to_timer).collect::<Result<Vec<_>, _>>()?)
    }

    async fn find_timer(&self, step_id: &StepId) -> Result<Option<ApprovalTimer>, StoreError> {
        let row = sqlx::query(
            "SELECT step_id, request_id, fire_at, attempts, last_error, created_at
             FROM approval_timer WHERE step_id = ?",
        )
        .bind(&step_id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.as_ref().map(row_to_timer).transpose()?)
    }

    async fn clear_timer(&self, step_id: &StepId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM approval_timer WHERE step_id = ?")
            .bind(&step_id.0)
            .execute(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn record_timer_failure(&self, step_id: &StepId, error: &str) -> Result<(), StoreError> {
        let error: String = error.chars().take(MAX_ERROR_LEN).collect();
        sqlx::query(
            "UPDATE approval_timer SET attempts = attempts + 1, last_error = ? WHERE step_id = ?",
        )
        .bind(error)
        .bind(&step_id.0)
        .execute(&self.pool)
        .await
        .map_err(RepositoryError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::{Duration, TimeZone, Utc};

    use signoff_core::domain::request::{StepId, StepStatus};
    use signoff_core::store::{ApprovalStore, RequestWrite, TimerOp, TimerStore, TransitionCommit};

    use super::SqlTimerStore;
    use crate::fixtures::{seed_request, setup_pool};
    use crate::repositories::SqlApprovalStore;

    #[tokio::test]
    async fn due_timers_compare_persisted_fire_times() {
        let pool = setup_pool().await;
        let base = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        let request = seed_request(&pool, "REQ-1", base).await;
        let step_id = request.steps[0].id.clone();
        let approvals = SqlApprovalStore::new(pool.clone());
        approvals
            .commit(TransitionCommit {
                request: RequestWrite::Unchanged,
                actions: Vec::new(),
                timers: vec![TimerOp::Schedule {
                    step_id: step_id.clone(),
                    request_id: request.id.clone(),
                    fire_at: base + Duration::hours(1),
                    created_at: base,
                }],
            })
            .await
            .expect("schedule");

        let timers = SqlTimerStore::new(pool);
        assert!(timers.due_timers(base + Duration::minutes(59), 10).await.expect("early").is_empty());

        let due = timers.due_timers(base + Duration::days(3), 10).await.expect("late");
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].step_id, step_id);

        timers.record_timer_failure(&step_id, "database is locked").await.expect("record");
        timers.record_timer_failure(&step_id, "database is locked").await.expect("record");
        let timer = timers.find_timer(&step_id).await.expect("find").expect("exists");
        assert_eq!(timer.attempts, 2);
        assert_eq!(timer.last_error.as_deref(), Some("database is locked"));

        timers.clear_timer(&step_id).await.expect("clear");
        assert!(timers.find_timer(&step_id).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn cancel_removes_the_deadline_inside_the_transition() {
        let pool = setup_pool().await;
        let base = Utc.with_ymd_and_hms(2026, 1, 5, 9, 0, 0).unwrap();
        let mut request = seed_request(&pool, "REQ-1", base).await;
        let step_id = request.steps[0].id.clone();
        let approvals = SqlApprovalStore::new(pool.clone());
        approvals
            .commit(TransitionCommit {
                request: RequestWrite::Unchanged,
                actions: Vec::new(),
                timers: vec![TimerOp::Schedule {
                    step_id: step_id.clone(),
                    request_id: request.id.clone(),
                    fire_at: base + Duration::hours(1),
                    created_at: base,
                }],
            })
            .await
            .expect("schedule");

        request.steps[0].step_status = StepStatus::Approved;
        request.steps[0].approvals = BTreeSet::from(["mia@example.com".to_string()]);
        request.steps[0].completed_at = Some(base + Duration::minutes(5));
        request.state_version += 1;
        approvals
            .commit(TransitionCommit {
                request: RequestWrite::Update { request, expected_version: 1 },
                actions: Vec::new(),
                timers: vec![TimerOp::Cancel { step_id: StepId(step_id.0.clone()) }],
            })
            .await
            .expect("decide");

        let timers = SqlTimerStore::new(pool);
        assert!(timers.due_timers(base + Duration::days(1), 10).await.expect("due").is_empty());
    }
}
