use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::action::ApprovalAction;
use crate::domain::normalize_key;
use crate::domain::request::{ApprovalRequest, RequestId, StepId};
use crate::domain::workflow::{WorkflowDefinition, WorkflowId};

use super::{
    ApprovalStore, ApprovalTimer, RequestFilter, RequestWrite, StoreError, TimerOp, TimerStore,
    TransitionCommit, WorkflowStore,
};

#[derive(Default)]
struct MemoryState {
    workflows: HashMap<String, WorkflowDefinition>,
    requests: HashMap<String, ApprovalRequest>,
    step_index: HashMap<String, String>,
    actions: HashMap<String, Vec<ApprovalAction>>,
    timers: HashMap<String, ApprovalTimer>,
}

#[derive(Default)]
pub struct InMemoryApprovalStore {
    state: RwLock<MemoryState>,
    failing_commits: AtomicU32,
}

impl InMemoryApprovalStore {
    /// Makes the next `count` commits fail with a backend error.
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    pub async fn timers(&self) -> Vec<ApprovalTimer> {
        let state = self.state.read().await;
        let mut timers: Vec<ApprovalTimer> = state.timers.values().cloned().collect();
        timers.sort_by(|left, right| left.fire_at.cmp(&right.fire_at));
        timers
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1))
            .is_ok()
    }
}

#[async_trait::async_trait]
impl WorkflowStore for InMemoryApprovalStore {
    async fn find_workflow(
        &self,
        id: &WorkflowId,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let state = self.state.read().await;
        Ok(state.workflows.get(&id.0).cloned())
    }

    async fn list_workflows(&self, tenant_id: &str) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let state = self.state.read().await;
        let mut workflows: Vec<WorkflowDefinition> = state
            .workflows
            .values()
            .filter(|workflow| workflow.tenant_id == tenant_id)
            .cloned()
            .collect();
        workflows.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(workflows)
    }

    async fn save_workflow(
        &self,
        workflow: WorkflowDefinition,
        expected_version: Option<u32>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let existing = state.workflows.get(&workflow.id.0).map(|stored| stored.version);
        if existing != expected_version {
            return Err(StoreError::Conflict { entity: "workflow", id: workflow.id.0.clone() });
        }
        state.workflows.insert(workflow.id.0.clone(), workflow);
        Ok(())
    }
}

#[async_trait::async_trait]
impl ApprovalStore for InMemoryApprovalStore {
    async fn find_request(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, StoreError> {
        let state = self.state.read().await;
        Ok(state.requests.get(&id.0).cloned())
    }

    async fn find_request_by_step(
        &self,
        step_id: &StepId,
    ) -> Result<Option<ApprovalRequest>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .step_index
            .get(&step_id.0)
            .and_then(|request_id| state.requests.get(request_id))
            .cloned())
    }

    async fn list_requests(
        &self,
        filter: &RequestFilter,
    ) -> Result<Vec<ApprovalRequest>, StoreError> {
        let state = self.state.read().await;
        let entity_type = filter.entity_type.as_deref().map(normalize_key);
        let mut requests: Vec<ApprovalRequest> = state
            .requests
            .values()
            .filter(|request| {
                filter.tenant_id.as_deref().map_or(true, |tenant| request.tenant_id == tenant)
            })
            .filter(|request| filter.status.map_or(true, |status| request.overall_status == status))
            .filter(|request| {
                entity_type.as_deref().map_or(true, |entity| request.entity_type == entity)
            })
            .cloned()
            .collect();
        requests.sort_by(|left, right| {
            right.requested_at.cmp(&left.requested_at).then_with(|| left.id.cmp(&right.id))
        });
        if let Some(limit) = filter.limit {
            requests.truncate(limit as usize);
        }
        Ok(requests)
    }

    async fn list_actions(
        &self,
        request_id: &RequestId,
    ) -> Result<Vec<ApprovalAction>, StoreError> {
        let state = self.state.read().await;
        let mut actions = state.actions.get(&request_id.0).cloned().unwrap_or_default();
        actions.sort_by(|left, right| {
            left.action_date.cmp(&right.action_date).then_with(|| left.sequence.cmp(&right.sequence))
        });
        Ok(actions)
    }

    async fn commit(&self, commit: TransitionCommit) -> Result<(), StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Backend("injected commit failure".to_string()));
        }

        let mut state = self.state.write().await;

        match &commit.request {
            RequestWrite::Insert(request) => {
                if state.requests.contains_key(&request.id.0) {
                    return Err(StoreError::Conflict {
                        entity: "approval_request",
                        id: request.id.0.clone(),
                    });
                }
            }
            RequestWrite::Update { request, expected_version } => {
                let current = state.requests.get(&request.id.0).map(|stored| stored.state_version);
                if current != Some(*expected_version) {
                    return Err(StoreError::Conflict {
                        entity: "approval_request",
                        id: request.id.0.clone(),
                    });
                }
            }
            RequestWrite::Unchanged => {}
        }

        for action in &commit.actions {
            let recorded = state.actions.get(&action.request_id.0).map_or(0, Vec::len);
            let pending_before = commit
                .actions
                .iter()
                .take_while(|other| other.id != action.id)
                .filter(|other| other.request_id == action.request_id)
                .count();
            let expected = u32::try_from(recorded + pending_before + 1).unwrap_or(u32::MAX);
            if action.sequence != expected {
                return Err(StoreError::Conflict {
                    entity: "approval_action",
                    id: action.request_id.0.clone(),
                });
            }
        }

        match commit.request {
            RequestWrite::Insert(request) | RequestWrite::Update { request, .. } => {
                for step in &request.steps {
                    state.step_index.insert(step.id.0.clone(), request.id.0.clone());
                }
                state.requests.insert(request.id.0.clone(), request);
            }
            RequestWrite::Unchanged => {}
        }

        for action in commit.actions {
            state.actions.entry(action.request_id.0.clone()).or_default().push(action);
        }

        for op in commit.timers {
            match op {
                TimerOp::Schedule { step_id, request_id, fire_at, created_at } => {
                    let timer = ApprovalTimer {
                        step_id: step_id.clone(),
                        request_id,
                        fire_at,
                        attempts: 0,
                        last_error: None,
                        created_at,
                    };
                    state.timers.insert(step_id.0, timer);
                }
                TimerOp::Cancel { step_id } => {
                    state.timers.remove(&step_id.0);
                }
            }
        }

        Ok(())
    }
}

#[async_trait::async_trait]
impl TimerStore for InMemoryApprovalStore {
    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<ApprovalTimer>, StoreError> {
        let state = self.state.read().await;
        let mut due: Vec<ApprovalTimer> =
            state.timers.values().filter(|timer| timer.fire_at <= now).cloned().collect();
        due.sort_by(|left, right| left.fire_at.cmp(&right.fire_at));
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn find_timer(&self, step_id: &StepId) -> Result<Option<ApprovalTimer>, StoreError> {
        let state = self.state.read().await;
        Ok(state.timers.get(&step_id.0).cloned())
    }

    async fn clear_timer(&self, step_id: &StepId) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.timers.remove(&step_id.0);
        Ok(())
    }

    async fn record_timer_failure(&self, step_id: &StepId, error: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if let Some(timer) = state.timers.get_mut(&step_id.0) {
            timer.attempts = timer.attempts.saturating_add(1);
            timer.last_error = Some(error.to_string());
        }
        Ok(())
    }
}
