use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Sqlite, Transaction};

use signoff_core::domain::action::{ActionId, ActionKind, ApprovalAction};
use signoff_core::domain::request::{
    ApprovalRequest, ApprovalStep, Decision, RequestId, RequestStatus, StepId, StepStatus,
};
use signoff_core::domain::workflow::{ApproverType, WorkflowId};
use signoff_core::store::{
    ApprovalStore, RequestFilter, RequestWrite, StoreError, TimerOp, TransitionCommit,
};

use super::{
    decode_json, decode_opt_ts, decode_ts, encode_json, encode_opt_ts, encode_ts, get, get_u32,
    parse_enum, RepositoryError,
};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, tenant_id, workflow_id, workflow_version, entity_type,
    entity_id, request_title, request_description, entity_snapshot_json, requested_by,
    requested_at, current_step_number, overall_status, expires_at, final_decision,
    final_decision_by, final_decision_notes, completed_at, require_all_approvers,
    allow_parallel_approval, auto_approve_if_creator_is_approver, state_version, updated_at";

const STEP_COLUMNS: &str = "id, request_id, step_number, step_name, approver_type,
    approver_roles_json, approver_emails_json, resolved_approvers_json, delegations_json,
    approvals_json, step_status, decision, decision_by, decision_at, decision_notes,
    delegated_to, delegated_at, started_at, completed_at, is_required, auto_approve_hours,
    resolution_error";

const ACTION_COLUMNS: &str = "id, request_id, step_id, step_order, approver_email, action,
    intended_action, comments, action_date, sequence, prev_hash, entry_hash";

/// Requests, their steps, the decision ledger and the timers a transition
/// schedules all live behind this store so one commit is one transaction.
pub struct SqlApprovalStore {
    pool: DbPool,
}

impl SqlApprovalStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn load_steps(&self, request: &mut ApprovalRequest) -> Result<(), RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {STEP_COLUMNS} FROM approval_step WHERE request_id = ? ORDER BY step_number ASC"
        ))
        .bind(&request.id.0)
        .fetch_all(&self.pool)
        .await?;
        request.steps = rows.iter().map(row_to_step).collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }

    async fn hydrate(&self, row: &SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
        let mut request = row_to_request(row)?;
        self.load_steps(&mut request).await?;
        Ok(request)
    }
}

fn row_to_request(row: &SqliteRow) -> Result<ApprovalRequest, RepositoryError> {
    let snapshot: String = get(row, "entity_snapshot_json")?;
    let requested_at: String = get(row, "requested_at")?;
    let updated_at: String = get(row, "updated_at")?;
    let status: String = get(row, "overall_status")?;
    let final_decision: Option<String> = get(row, "final_decision")?;

    Ok(ApprovalRequest {
        id: RequestId(get(row, "id")?),
        tenant_id: get(row, "tenant_id")?,
        workflow_id: WorkflowId(get(row, "workflow_id")?),
        workflow_version: get_u32(row, "workflow_version")?,
        entity_type: get(row, "entity_type")?,
        entity_id: get(row, "entity_id")?,
        request_title: get(row, "request_title")?,
        request_description: get(row, "request_description")?,
        entity_snapshot: decode_json(&snapshot, "entity_snapshot_json")?,
        requested_by: get(row, "requested_by")?,
        requested_at: decode_ts(&requested_at, "requested_at")?,
        current_step_number: get_u32(row, "current_step_number")?,
        overall_status: parse_enum(&status, "overall_status", RequestStatus::parse)?,
        expires_at: decode_opt_ts(get(row, "expires_at")?, "expires_at")?,
        final_decision: final_decision
            .as_deref()
            .map(|raw| parse_enum(raw, "final_decision", Decision::parse))
            .transpose()?,
        final_decision_by: get(row, "final_decision_by")?,
        final_decision_notes: get(row, "final_decision_notes")?,
        completed_at: decode_opt_ts(get(row, "completed_at")?, "completed_at")?,
        require_all_approvers: get(row, "require_all_approvers")?,
        allow_parallel_approval: get(row, "allow_parallel_approval")?,
        auto_approve_if_creator_is_approver: get(row, "auto_approve_if_creator_is_approver")?,
        state_version: get_u32(row, "state_version")?,
        updated_at: decode_ts(&updated_at, "updated_at")?,
        steps: Vec::new(),
    })
}

fn row_to_step(row: &SqliteRow) -> Result<ApprovalStep, RepositoryError> {
    let approver_type: String = get(row, "approver_type")?;
    let status: String = get(row, "step_status")?;
    let decision: Option<String> = get(row, "decision")?;
    let roles: String = get(row, "approver_roles_json")?;
    let emails: String = get(row, "approver_emails_json")?;
    let resolved: String = get(row, "resolved_approvers_json")?;
    let delegations: String = get(row, "delegations_json")?;
    let approvals: String = get(row, "approvals_json")?;

    Ok(ApprovalStep {
        id: StepId(get(row, "id")?),
        request_id: RequestId(get(row, "request_id")?),
        step_number: get_u32(row, "step_number")?,
        step_name: get(row, "step_name")?,
        approver_type: parse_enum(&approver_type, "approver_type", ApproverType::parse)?,
        approver_roles: decode_json(&roles, "approver_roles_json")?,
        approver_emails: decode_json(&emails, "approver_emails_json")?,
        resolved_approvers: decode_json(&resolved, "resolved_approvers_json")?,
        delegations: decode_json(&delegations, "delegations_json")?,
        approvals: decode_json(&approvals, "approvals_json")?,
        step_status: parse_enum(&status, "step_status", StepStatus::parse)?,
        decision: decision
            .as_deref()
            .map(|raw| parse_enum(raw, "decision", Decision::parse))
            .transpose()?,
        decision_by: get(row, "decision_by")?,
        decision_at: decode_opt_ts(get(row, "decision_at")?, "decision_at")?,
        decision_notes: get(row, "decision_notes")?,
        delegated_to: get(row, "delegated_to")?,
        delegated_at: decode_opt_ts(get(row, "delegated_at")?, "delegated_at")?,
        started_at: decode_opt_ts(get(row, "started_at")?, "started_at")?,
        completed_at: decode_opt_ts(get(row, "completed_at")?, "completed_at")?,
        is_required: get(row, "is_required")?,
        auto_approve_hours: get(row, "auto_approve_hours")?,
        resolution_error: get(row, "resolution_error")?,
    })
}

fn row_to_action(row: &SqliteRow) -> Result<ApprovalAction, RepositoryError> {
    let action: String = get(row, "action")?;
    let intended: Option<String> = get(row, "intended_action")?;
    let action_date: String = get(row, "action_date")?;
    let step_id: Option<String> = get(row, "step_id")?;

    Ok(ApprovalAction {
        id: ActionId(get(row, "id")?),
        request_id: RequestId(get(row, "request_id")?),
        step_id: step_id.map(StepId),
        step_order: get_u32(row, "step_order")?,
        approver_email: get(row, "approver_email")?,
        action: parse_enum(&action, "action", ActionKind::parse)?,
        intended_action: intended
            .as_deref()
            .map(|raw| parse_enum(raw, "intended_action", ActionKind::parse))
            .transpose()?,
        comments: get(row, "comments")?,
        action_date: decode_ts(&action_date, "action_date")?,
        sequence: get_u32(row, "sequence")?,
        prev_hash: get(row, "prev_hash")?,
        entry_hash: get(row, "entry_hash")?,
    })
}

async fn insert_request(
    tx: &mut Transaction<'_, Sqlite>,
    request: &ApprovalRequest,
) -> Result<(), RepositoryError> {
    sqlx::query(&format!(
        "INSERT INTO approval_request ({REQUEST_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&request.id.0)
    .bind(&request.tenant_id)
    .bind(&request.workflow_id.0)
    .bind(i64::from(request.workflow_version))
    .bind(&request.entity_type)
    .bind(&request.entity_id)
    .bind(&request.request_title)
    .bind(&request.request_description)
    .bind(encode_json(&request.entity_snapshot)?)
    .bind(&request.requested_by)
    .bind(encode_ts(request.requested_at))
    .bind(i64::from(request.current_step_number))
    .bind(request.overall_status.as_str())
    .bind(encode_opt_ts(request.expires_at))
    .bind(request.final_decision.map(|decision| decision.as_str()))
    .bind(&request.final_decision_by)
    .bind(&request.final_decision_notes)
    .bind(encode_opt_ts(request.completed_at))
    .bind(request.require_all_approvers)
    .bind(request.allow_parallel_approval)
    .bind(request.auto_approve_if_creator_is_approver)
    .bind(i64::from(request.state_version))
    .bind(encode_ts(request.updated_at))
    .execute(&mut **tx)
    .await
    .map_err(|error| RepositoryError::from_write(error, "approval_request", &request.id.0))?;
    Ok(())
}

async fn update_request(
    tx: &mut Transaction<'_, Sqlite>,
    request: &ApprovalRequest,
    expected_version: u32,
) -> Result<(), RepositoryError> {
    let result = sqlx::query(
        "UPDATE approval_request SET
             current_step_number = ?, overall_status = ?, final_decision = ?,
             final_decision_by = ?, final_decision_notes = ?, completed_at = ?,
             state_version = ?, updated_at = ?
         WHERE id = ? AND state_version = ?",
    )
    .bind(i64::from(request.current_step_number))
    .bind(request.overall_status.as_str())
    .bind(request.final_decision.map(|decision| decision.as_str()))
    .bind(&request.final_decision_by)
    .bind(&request.final_decision_notes)
    .bind(encode_opt_ts(request.completed_at))
    .bind(i64::from(request.state_version))
    .bind(encode_ts(request.updated_at))
    .bind(&request.id.0)
    .bind(i64::from(expected_version))
    .execute(&mut **tx)
    .await?;

    if result.rows_affected() == 0 {
        return Err(RepositoryError::Conflict {
            entity: "approval_request",
            id: request.id.0.clone(),
        });
    }
    Ok(())
}

async fn upsert_step(
    tx: &mut Transaction<'_, Sqlite>,
    step: &ApprovalStep,
) -> Result<(), RepositoryError> {
    sqlx::query(&format!(
        "INSERT INTO approval_step ({STEP_COLUMNS})
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
             resolved_approvers_json = excluded.resolved_approvers_json,
             delegations_json = excluded.delegations_json,
             approvals_json = excluded.approvals_json,
             step_status = excluded.step_status,
             decision = excluded.decision,
             decision_by = excluded.decision_by,
             decision_at = excluded.decision_at,
             decision_notes = excluded.decision_notes,
             delegated_to = excluded.delegated_to,
             delegated_at = excluded.delegated_at,
             started_at = excluded.started_at,
             completed_at = excluded.completed_at,
             resolution_error = excluded.resolution_error"
    ))
    .bind(&step.id.0)
    .bind(&step.request_id.0)
    .bind(i64::from(step.step_number))
    .bind(&step.step_name)
    .bind(step.approver_type.as_str())
    .bind(encode_json(&step.approver_roles)?)
    .bind(encode_json(&step.approver_emails)?)
    .bind(encode_json(&step.resolved_approvers)?)
    .bind(encode_json(&step.delegations)?)
    .bind(encode_json(&step.approvals)?)
    .bind(step.step_status.as_str())
    .bind(step.decision.map(|decision| decision.as_str()))
    .bind(&step.decision_by)
    .bind(encode_opt_ts(step.decision_at))
    .bind(&step.decision_notes)
    .bind(&step.delegated_to)
    .bind(encode_opt_ts(step.delegated_at))
    .bind(encode_opt_ts(step.started_at))
    .bind(encode_opt_ts(step.completed_at))
    .bind(step.is_required)
    .bind(step.auto_approve_hours)
    .bind(&step.resolution_error)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn append_action(
    tx: &mut Transaction<'_, Sqlite>,
    action: &ApprovalAction,
) -> Result<(), RepositoryError> {
    sqlx::query(&format!(
        "INSERT INTO approval_action ({ACTION_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    ))
    .bind(&action.id.0)
    .bind(&action.request_id.0)
    .bind(action.step_id.as_ref().map(|step_id| step_id.0.as_str()))
    .bind(i64::from(action.step_order))
    .bind(&action.approver_email)
    .bind(action.action.as_str())
    .bind(action.intended_action.map(|kind| kind.as_str()))
    .bind(&action.comments)
    .bind(encode_ts(action.action_date))
    .bind(i64::from(action.sequence))
    .bind(&action.prev_hash)
    .bind(&action.entry_hash)
    .execute(&mut **tx)
    .await
    .map_err(|error| RepositoryError::from_write(error, "approval_action", &action.request_id.0))?;
    Ok(())
}

async fn apply_timer(tx: &mut Transaction<'_, Sqlite>, op: &TimerOp) -> Result<(), RepositoryError> {
    match op {
        TimerOp::Schedule { step_id, request_id, fire_at, created_at } => {
            sqlx::query(
                "INSERT INTO approval_timer (step_id, request_id, fire_at, attempts, last_error, created_at)
                 VALUES (?, ?, ?, 0, NULL, ?)
                 ON CONFLICT(step_id) DO UPDATE SET
                     fire_at = excluded.fire_at,
                     attempts = 0,
                     last_error = NULL",
            )
            .bind(&step_id.0)
            .bind(&request_id.0)
            .bind(encode_ts(*fire_at))
            .bind(encode_ts(*created_at))
            .execute(&mut **tx)
            .await?;
        }
        TimerOp::Cancel { step_id } => {
            sqlx::query("DELETE FROM approval_timer WHERE step_id = ?")
                .bind(&step_id.0)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

#[async_trait]
impl ApprovalStore for SqlApprovalStore {
    async fn find_request(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, StoreError> {
        let row = sqlx::query(&format!("SELECT {REQUEST_COLUMNS} FROM approval_request WHERE id = ?"))
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        match row {
            Some(ref row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn find_request_by_step(
        &self,
        step_id: &StepId,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let request_id: Option<String> =
            sqlx::query_scalar("SELECT request_id FROM approval_step WHERE id = ?")
                .bind(&step_id.0)
                .fetch_optional(&self.pool)
                .await
                .map_err(RepositoryError::from)?;

        match request_id {
            Some(request_id) => self.find_request(&RequestId(request_id)).await,
            None => Ok(None),
        }
    }

    async fn list_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let mut query: QueryBuilder<'_, Sqlite> = QueryBuilder::new(format!(
            "SELECT {REQUEST_COLUMNS} FROM approval_request WHERE 1 = 1"
        ));
        if let Some(tenant_id) = &filter.tenant_id {
            query.push(" AND tenant_id = ").push_bind(tenant_id.clone());
        }
        if let Some(status) = filter.status {
            query.push(" AND overall_status = ").push_bind(status.as_str());
        }
        if let Some(entity_type) = &filter.entity_type {
            query.push(" AND entity_type = ").push_bind(entity_type.trim().to_ascii_lowercase());
        }
        query.push(" ORDER BY requested_at DESC, id ASC");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(i64::from(limit));
        }

        let rows = query.build().fetch_all(&self.pool).await.map_err(RepositoryError::from)?;
        let mut requests = Vec::with_capacity(rows.len());
        for row in &rows {
            requests.push(self.hydrate(row).await?);
        }
        Ok(requests)
    }

    async fn list_actions(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ApprovalAction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACTION_COLUMNS} FROM approval_action
             WHERE request_id = ? ORDER BY action_date ASC, sequence ASC"
        ))
        .bind(&request_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(row_to_action).collect::<Result<Vec<_>, _>>()?)
    }

    async fn commit(&self, commit: TransitionCommit) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        match &commit.request {
            RequestWrite::Insert(request) => {
                insert_request(&mut tx, request).await?;
                for step in &request.steps {
                    upsert_step(&mut tx, step).await?;
                }
            }
            RequestWrite::Update { request, expected_version } => {
                update_request(&mut tx, request, *expected_version).await?;
                for step in &request.steps {
                    upsert_step(&mut tx, step).await?;
                }
            }
            RequestWrite::Unchanged => {}
        }

        for action in &commit.actions {
            append_action(&mut tx, action).await?;
        }
        for op in &commit.timers {
            apply_timer(&mut tx, op).await?;
        }

        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(())
    }
}
