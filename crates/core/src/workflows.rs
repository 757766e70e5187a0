use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::approvals::Actor;
use crate::clock::Clock;
use crate::domain::workflow::{StepTemplate, WorkflowDefinition, WorkflowId};
use crate::errors::{ApplicationError, DomainError};
use crate::store::WorkflowStore;

/// Create/update payload for a workflow definition. `id` selects update.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDraft {
    #[serde(default)]
    pub id: Option<WorkflowId>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger_entity_type: String,
    pub steps: Vec<StepTemplate>,
    #[serde(default)]
    pub require_all_approvers: bool,
    #[serde(default)]
    pub allow_parallel_approval: bool,
    #[serde(default)]
    pub auto_approve_if_creator_is_approver: bool,
    #[serde(default)]
    pub is_active: Option<bool>,
}

/// Administrator-facing workflow definition store.
pub struct WorkflowCatalog {
    store: Arc<dyn WorkflowStore>,
    clock: Arc<dyn Clock>,
}

impl WorkflowCatalog {
    pub fn new(store: Arc<dyn WorkflowStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub async fn save(
        &self,
        actor: &Actor,
        draft: WorkflowDraft,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        let tenant_id = require_admin(actor)?;
        let now = self.clock.now();

        let (mut workflow, expected_version) = match &draft.id {
            Some(id) => {
                let existing = self.find(&tenant_id, id).await?;
                if existing.is_archived() {
                    return Err(archived(id));
                }
                let expected = existing.version;
                let workflow = WorkflowDefinition {
                    name: draft.name,
                    description: draft.description,
                    trigger_entity_type: draft.trigger_entity_type,
                    steps: draft.steps,
                    require_all_approvers: draft.require_all_approvers,
                    allow_parallel_approval: draft.allow_parallel_approval,
                    auto_approve_if_creator_is_approver: draft.auto_approve_if_creator_is_approver,
                    is_active: draft.is_active.unwrap_or(existing.is_active),
                    version: existing.version.saturating_add(1),
                    updated_at: now,
                    ..existing
                };
                (workflow, Some(expected))
            }
            None => {
                let workflow = WorkflowDefinition {
                    id: WorkflowId(Uuid::new_v4().to_string()),
                    tenant_id,
                    name: draft.name,
                    description: draft.description,
                    trigger_entity_type: draft.trigger_entity_type,
                    steps: draft.steps,
                    require_all_approvers: draft.require_all_approvers,
                    allow_parallel_approval: draft.allow_parallel_approval,
                    auto_approve_if_creator_is_approver: draft.auto_approve_if_creator_is_approver,
                    is_active: draft.is_active.unwrap_or(true),
                    version: 1,
                    created_by: actor.email().to_string(),
                    created_at: now,
                    updated_at: now,
                    archived_at: None,
                };
                (workflow, None)
            }
        };

        workflow.normalize();
        workflow.validate().map_err(DomainError::from)?;
        self.store.save_workflow(workflow.clone(), expected_version).await?;

        info!(
            event_name = "workflow.saved",
            correlation_id = %workflow.id.0,
            workflow_id = %workflow.id.0,
            version = workflow.version,
            steps = workflow.steps.len(),
            actor = %actor.email(),
            "workflow definition saved"
        );
        Ok(workflow)
    }

    pub async fn activate(
        &self,
        actor: &Actor,
        id: &WorkflowId,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        self.set_state(actor, id, WorkflowChange::Activate).await
    }

    /// New requests are refused; requests already in flight are unaffected.
    pub async fn deactivate(
        &self,
        actor: &Actor,
        id: &WorkflowId,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        self.set_state(actor, id, WorkflowChange::Deactivate).await
    }

    pub async fn archive(
        &self,
        actor: &Actor,
        id: &WorkflowId,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        self.set_state(actor, id, WorkflowChange::Archive).await
    }

    pub async fn get(
        &self,
        actor: &Actor,
        id: &WorkflowId,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        self.find(actor.tenant_id().unwrap_or_default(), id).await
    }

    pub async fn list(
        &self,
        actor: &Actor,
        include_archived: bool,
    ) -> Result<Vec<WorkflowDefinition>, ApplicationError> {
        let mut workflows =
            self.store.list_workflows(actor.tenant_id().unwrap_or_default()).await?;
        if !include_archived {
            workflows.retain(|workflow| !workflow.is_archived());
        }
        Ok(workflows)
    }

    async fn set_state(
        &self,
        actor: &Actor,
        id: &WorkflowId,
        change: WorkflowChange,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        let tenant_id = require_admin(actor)?;
        let existing = self.find(&tenant_id, id).await?;
        if existing.is_archived() {
            return match change {
                WorkflowChange::Archive | WorkflowChange::Deactivate => Ok(existing),
                WorkflowChange::Activate => Err(archived(id)),
            };
        }

        let now = self.clock.now();
        let expected = existing.version;
        let mut workflow = existing;
        match change {
            WorkflowChange::Activate if workflow.is_active => return Ok(workflow),
            WorkflowChange::Deactivate if !workflow.is_active => return Ok(workflow),
            WorkflowChange::Activate => workflow.is_active = true,
            WorkflowChange::Deactivate => workflow.is_active = false,
            WorkflowChange::Archive => {
                workflow.is_active = false;
                workflow.archived_at = Some(now);
            }
        }
        workflow.version = workflow.version.saturating_add(1);
        workflow.updated_at = now;
        self.store.save_workflow(workflow.clone(), Some(expected)).await?;

        info!(
            event_name = "workflow.state_changed",
            correlation_id = %workflow.id.0,
            workflow_id = %workflow.id.0,
            change = change.as_str(),
            version = workflow.version,
            "workflow state changed"
        );
        Ok(workflow)
    }

    async fn find(
        &self,
        tenant_id: &str,
        id: &WorkflowId,
    ) -> Result<WorkflowDefinition, ApplicationError> {
        self.store
            .find_workflow(id)
            .await?
            .filter(|workflow| workflow.tenant_id == tenant_id)
            .ok_or_else(|| DomainError::NotFound { entity: "workflow", id: id.0.clone() }.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkflowChange {
    Activate,
    Deactivate,
    Archive,
}

impl WorkflowChange {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Deactivate => "deactivate",
            Self::Archive => "archive",
        }
    }
}

fn require_admin(actor: &Actor) -> Result<String, ApplicationError> {
    actor.ensure_not_impersonating()?;
    let tenant_id = actor.tenant_id().unwrap_or_default().to_string();
    if !actor.is_admin() || tenant_id.is_empty() {
        return Err(DomainError::NotAuthorized {
            actor: actor.email().to_string(),
            reason: "workflow administration requires an administrator".to_string(),
        }
        .into());
    }
    Ok(tenant_id)
}

fn archived(id: &WorkflowId) -> ApplicationError {
    DomainError::Validation(format!("workflow `{}` is archived", id.0)).into()
}
