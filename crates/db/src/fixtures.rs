//! Shared setup for the repository tests.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use signoff_core::domain::request::{
    ApprovalRequest, ApprovalStep, RequestId, RequestStatus, StepId, StepStatus,
};
use signoff_core::domain::workflow::{StepTemplate, WorkflowDefinition, WorkflowId};
use signoff_core::store::{ApprovalStore, RequestWrite, TransitionCommit, WorkflowStore};

use crate::repositories::{SqlApprovalStore, SqlWorkflowStore};
use crate::{connect_with_settings, migrations, DbPool};

pub(crate) const WORKFLOW_ID: &str = "WF-FIXTURE";

pub(crate) async fn setup_pool() -> DbPool {
    let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    pool
}

/// Inserts a one-step in-progress request (and its workflow on first use).
pub(crate) async fn seed_request(pool: &DbPool, id: &str, at: DateTime<Utc>) -> ApprovalRequest {
    let workflows = SqlWorkflowStore::new(pool.clone());
    let workflow_id = WorkflowId(WORKFLOW_ID.to_string());
    if workflows.find_workflow(&workflow_id).await.expect("find workflow").is_none() {
        workflows
            .save_workflow(
                WorkflowDefinition {
                    id: workflow_id.clone(),
                    tenant_id: "tenant-a".to_string(),
                    name: "Fixture workflow".to_string(),
                    description: None,
                    trigger_entity_type: "policy".to_string(),
                    steps: vec![StepTemplate::users(1, "Owner", &["mia@example.com"])],
                    require_all_approvers: false,
                    allow_parallel_approval: false,
                    auto_approve_if_creator_is_approver: false,
                    is_active: true,
                    version: 1,
                    created_by: "admin@example.com".to_string(),
                    created_at: at,
                    updated_at: at,
                    archived_at: None,
                },
                None,
            )
            .await
            .expect("seed workflow");
    }

    let request_id = RequestId(id.to_string());
    let mut step = ApprovalStep::from_template(
        StepId(format!("{id}-S1")),
        request_id.clone(),
        &StepTemplate::users(1, "Owner", &["mia@example.com"]),
    );
    step.step_status = StepStatus::InProgress;
    step.started_at = Some(at);
    step.resolved_approvers = BTreeSet::from(["mia@example.com".to_string()]);

    let request = ApprovalRequest {
        id: request_id,
        tenant_id: "tenant-a".to_string(),
        workflow_id,
        workflow_version: 1,
        entity_type: "policy".to_string(),
        entity_id: format!("POL-{id}"),
        request_title: format!("Fixture {id}"),
        request_description: None,
        entity_snapshot: serde_json::Value::Null,
        requested_by: "rita@example.com".to_string(),
        requested_at: at,
        current_step_number: 1,
        overall_status: RequestStatus::InProgress,
        expires_at: None,
        final_decision: None,
        final_decision_by: None,
        final_decision_notes: None,
        completed_at: None,
        require_all_approvers: false,
        allow_parallel_approval: false,
        auto_approve_if_creator_is_approver: false,
        state_version: 1,
        updated_at: at,
        steps: vec![step],
    };

    SqlApprovalStore::new(pool.clone())
        .commit(TransitionCommit {
            request: RequestWrite::Insert(request.clone()),
            actions: Vec::new(),
            timers: Vec::new(),
        })
        .await
        .expect("seed request");
    request
}
