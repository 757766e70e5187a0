use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;

use signoff_core::domain::workflow::{StepTemplate, WorkflowDefinition, WorkflowId};
use signoff_core::store::{StoreError, WorkflowStore};

use super::{
    decode_json, decode_opt_ts, decode_ts, encode_json, encode_opt_ts, encode_ts, get, get_u32,
    RepositoryError,
};
use crate::DbPool;

const WORKFLOW_COLUMNS: &str = "id, tenant_id, name, description, trigger_entity_type, steps_json,
    require_all_approvers, allow_parallel_approval, auto_approve_if_creator_is_approver,
    is_active, version, created_by, created_at, updated_at, archived_at";

pub struct SqlWorkflowStore {
    pool: DbPool,
}

impl SqlWorkflowStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    async fn insert(&self, workflow: &WorkflowDefinition) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO workflow_definition (id, tenant_id, name, description, trigger_entity_type,
                 steps_json, require_all_approvers, allow_parallel_approval,
                 auto_approve_if_creator_is_approver, is_active, version, created_by,
                 created_at, updated_at, archived_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&workflow.id.0)
        .bind(&workflow.tenant_id)
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.trigger_entity_type)
        .bind(encode_json(&workflow.steps)?)
        .bind(workflow.require_all_approvers)
        .bind(workflow.allow_parallel_approval)
        .bind(workflow.auto_approve_if_creator_is_approver)
        .bind(workflow.is_active)
        .bind(i64::from(workflow.version))
        .bind(&workflow.created_by)
        .bind(encode_ts(workflow.created_at))
        .bind(encode_ts(workflow.updated_at))
        .bind(encode_opt_ts(workflow.archived_at))
        .execute(&self.pool)
        .await
        .map_err(|error| RepositoryError::from_write(error, "workflow", &workflow.id.0))?;
        Ok(())
    }

    async fn update(
        &self,
        workflow: &WorkflowDefinition,
        expected_version: u32,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_definition SET
                 name = ?, description = ?, trigger_entity_type = ?, steps_json = ?,
                 require_all_approvers = ?, allow_parallel_approval = ?,
                 auto_approve_if_creator_is_approver = ?, is_active = ?, version = ?,
                 updated_at = ?, archived_at = ?
             WHERE id = ? AND version = ?",
        )
        .bind(&workflow.name)
        .bind(&workflow.description)
        .bind(&workflow.trigger_entity_type)
        .bind(encode_json(&workflow.steps)?)
        .bind(workflow.require_all_approvers)
        .bind(workflow.allow_parallel_approval)
        .bind(workflow.auto_approve_if_creator_is_approver)
        .bind(workflow.is_active)
        .bind(i64::from(workflow.version))
        .bind(encode_ts(workflow.updated_at))
        .bind(encode_opt_ts(workflow.archived_at))
        .bind(&workflow.id.0)
        .bind(i64::from(expected_version))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::Conflict { entity: "workflow", id: workflow.id.0.clone() });
        }
        Ok(())
    }
}

fn row_to_workflow(row: &SqliteRow) -> Result<WorkflowDefinition, RepositoryError> {
    let steps_json: String = get(row, "steps_json")?;
    let steps: Vec<StepTemplate> = decode_json(&steps_json, "steps_json")?;
    let created_at: String = get(row, "created_at")?;
    let updated_at: String = get(row, "updated_at")?;

    Ok(WorkflowDefinition {
        id: WorkflowId(get(row, "id")?),
        tenant_id: get(row, "tenant_id")?,
        name: get(row, "name")?,
        description: get(row, "description")?,
        trigger_entity_type: get(row, "trigger_entity_type")?,
        steps,
        require_all_approvers: get(row, "require_all_approvers")?,
        allow_parallel_approval: get(row, "allow_parallel_approval")?,
        auto_approve_if_creator_is_approver: get(row, "auto_approve_if_creator_is_approver")?,
        is_active: get(row, "is_active")?,
        version: get_u32(row, "version")?,
        created_by: get(row, "created_by")?,
        created_at: decode_ts(&created_at, "created_at")?,
        updated_at: decode_ts(&updated_at, "updated_at")?,
        archived_at: decode_opt_ts(get(row, "archived_at")?, "archived_at")?,
    })
}

#[async_trait]
impl WorkflowStore for SqlWorkflowStore {
    async fn find_workflow(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_definition WHERE id = ?"
        ))
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(row.as_ref().map(row_to_workflow).transpose()?)
    }

    async fn list_workflows(&self, tenant_id: &str) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM workflow_definition
             WHERE tenant_id = ? ORDER BY name ASC, id ASC"
        ))
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        Ok(rows.iter().map(row_to_workflow).collect::<Result<Vec<_>, _>>()?)
    }

    async fn save_workflow(
        &self,
        workflow: WorkflowDefinition,
        expected_version: Option<u32>,
    ) -> Result<(), StoreError> {
        match expected_version {
            None => self.insert(&workflow).await?,
            Some(expected) => self.update(&workflow, expected).await?,
        }
        Ok(())
    }
}
