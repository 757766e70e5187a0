//! Persistence ports for the approval engine.
//!
//! A single [`TransitionCommit`] carries everything one transition changes:
//! the request (with its steps), new ledger entries and timer operations.
//! Implementations must apply it atomically and reject it when the request's
//! `state_version` moved underneath the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::action::ApprovalAction;
use crate::domain::request::{ApprovalRequest, RequestId, RequestStatus, StepId};
use crate::domain::workflow::{WorkflowDefinition, WorkflowId};
use crate::errors::ApplicationError;

pub mod memory;

pub use memory::InMemoryApprovalStore;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("version conflict on {entity} `{id}`")]
    Conflict { entity: &'static str, id: String },
    #[error("storage backend failure: {0}")]
    Backend(String),
    #[error("decode error: {0}")]
    Decode(String),
}

impl From<StoreError> for ApplicationError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::Conflict { .. } => Self::Conflict(value.to_string()),
            StoreError::Backend(_) | StoreError::Decode(_) => Self::Persistence(value.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalTimer {
    pub step_id: StepId,
    pub request_id: RequestId,
    pub fire_at: DateTime<Utc>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TimerOp {
    /// `created_at` is the transition clock, not the time the write lands.
    Schedule {
        step_id: StepId,
        request_id: RequestId,
        fire_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    },
    Cancel { step_id: StepId },
}

#[derive(Clone, Debug, PartialEq)]
pub enum RequestWrite {
    Insert(ApprovalRequest),
    Update { request: ApprovalRequest, expected_version: u32 },
    Unchanged,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TransitionCommit {
    pub request: RequestWrite,
    pub actions: Vec<ApprovalAction>,
    pub timers: Vec<TimerOp>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestFilter {
    pub tenant_id: Option<String>,
    pub status: Option<RequestStatus>,
    pub entity_type: Option<String>,
    pub limit: Option<u32>,
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn find_workflow(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn list_workflows(&self, tenant_id: &str) -> Result<Vec<WorkflowDefinition>, StoreError>;

    /// Inserts when `expected_version` is `None`, otherwise updates only if the
    /// stored version still matches.
    async fn save_workflow(
        &self,
        workflow: WorkflowDefinition,
        expected_version: Option<u32>,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ApprovalStore: Send + Sync {
    async fn find_request(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, StoreError>;

    async fn find_request_by_step(
        &self,
        step_id: &StepId,
    ) -> Result<Option<ApprovalRequest>, StoreError>;

    async fn list_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ApprovalRequest>, StoreError>;

    /// Ledger entries ordered by `action_date`, then `sequence`.
    async fn list_actions(&self, request_id: &RequestId)
        -> Result<Vec<ApprovalAction>, StoreError>;

    async fn commit(&self, commit: TransitionCommit) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TimerStore: Send + Sync {
    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalTimer>, StoreError>;

    async fn find_timer(&self, step_id: &StepId) -> Result<Option<ApprovalTimer>, StoreError>;

    async fn clear_timer(&self, step_id: &StepId) -> Result<(), StoreError>;

    async fn record_timer_failure(&self, step_id: &StepId, error: &str) -> Result<(), StoreError>;
}
