use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::approvals::lifecycle::{Actor, Command, Outcome, Transition, TransitionOutput};
use crate::approvals::locks::KeyedLocks;
use crate::approvals::resolver::{ApproverResolver, IdentityDirectory};
use crate::clock::Clock;
use crate::domain::action::{ActionKind, ApprovalAction};
use crate::domain::normalize_key;
use crate::domain::request::{ApprovalRequest, ApprovalStep, RequestId, RequestStatus, StepId};
use crate::domain::workflow::WorkflowId;
use crate::errors::{ApplicationError, DomainError};
use crate::ledger::{self, LedgerTail, VerificationResult};
use crate::notifications::NotificationSink;
use crate::store::{
    ApprovalStore, RequestFilter, RequestWrite, StoreError, TimerStore, TransitionCommit,
    WorkflowStore,
};

const MAX_COMMIT_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewApprovalRequest {
    pub workflow_id: WorkflowId,
    pub entity_type: String,
    pub entity_id: String,
    pub request_title: String,
    #[serde(default)]
    pub request_description: Option<String>,
    #[serde(default)]
    pub entity_data: Option<serde_json::Value>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestQuery {
    pub status: Option<RequestStatus>,
    pub entity_type: Option<String>,
    /// Only requests this identity can currently act on.
    pub approver: Option<String>,
    pub limit: Option<u32>,
}

/// A request with its ledger, as shown on the request timeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestView {
    #[serde(flatten)]
    pub request: ApprovalRequest,
    pub actions: Vec<ApprovalAction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutOutcome {
    AutoApproved,
    /// The step had already left `in_progress`; only the timer was dropped.
    Stale,
}

pub struct ApprovalService {
    workflows: Arc<dyn WorkflowStore>,
    store: Arc<dyn ApprovalStore>,
    timers: Arc<dyn TimerStore>,
    resolver: ApproverResolver,
    notifier: Arc<dyn NotificationSink>,
    clock: Arc<dyn Clock>,
    locks: KeyedLocks,
}

impl ApprovalService {
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        store: Arc<dyn ApprovalStore>,
        timers: Arc<dyn TimerStore>,
        directory: Arc<dyn IdentityDirectory>,
        notifier: Arc<dyn NotificationSink>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            workflows,
            store,
            timers,
            resolver: ApproverResolver::new(directory),
            notifier,
            clock,
            locks: KeyedLocks::default(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub async fn submit(
        &self,
        actor: &Actor,
        input: NewApprovalRequest,
    ) -> Result<ApprovalRequest, ApplicationError> {
        actor.ensure_not_impersonating()?;
        let tenant_id = actor.tenant_id().unwrap_or_default().to_string();
        let entity_id = input.entity_id.trim().to_string();
        let request_title = input.request_title.trim().to_string();
        if actor.email().is_empty() || tenant_id.is_empty() {
            return Err(DomainError::Validation("requester identity is required".to_string()).into());
        }
        if entity_id.is_empty() {
            return Err(DomainError::Validation("entity_id must not be blank".to_string()).into());
        }
        if request_title.is_empty() {
            return Err(DomainError::Validation("request_title must not be blank".to_string()).into());
        }

        let workflow = self
            .workflows
            .find_workflow(&input.workflow_id)
            .await?
            .filter(|workflow| workflow.tenant_id == tenant_id)
            .ok_or_else(|| DomainError::NotFound {
                entity: "workflow",
                id: input.workflow_id.0.clone(),
            })?;
        if !workflow.is_active || workflow.is_archived() {
            return Err(DomainError::Validation(format!(
                "workflow `{}` is not active",
                workflow.id.0
            ))
            .into());
        }
        if !workflow.accepts_entity_type(&input.entity_type) {
            return Err(DomainError::Validation(format!(
                "workflow `{}` handles `{}` entities, not `{}`",
                workflow.id.0,
                workflow.trigger_entity_type,
                input.entity_type.trim()
            ))
            .into());
        }

        let now = self.clock.now();
        let request_id = RequestId(Uuid::new_v4().to_string());
        let steps = workflow
            .steps
            .iter()
            .map(|template| {
                ApprovalStep::from_template(
                    StepId(Uuid::new_v4().to_string()),
                    request_id.clone(),
                    template,
                )
            })
            .collect();
        let request = ApprovalRequest {
            id: request_id.clone(),
            tenant_id,
            workflow_id: workflow.id.clone(),
            workflow_version: workflow.version,
            entity_type: normalize_key(&input.entity_type),
            entity_id,
            request_title,
            request_description: input
                .request_description
                .map(|description| description.trim().to_string())
                .filter(|description| !description.is_empty()),
            entity_snapshot: input.entity_data.unwrap_or(serde_json::Value::Null),
            requested_by: actor.email().to_string(),
            requested_at: now,
            current_step_number: 1,
            overall_status: RequestStatus::Pending,
            expires_at: input.expires_at,
            final_decision: None,
            final_decision_by: None,
            final_decision_notes: None,
            completed_at: None,
            require_all_approvers: workflow.require_all_approvers,
            allow_parallel_approval: workflow.allow_parallel_approval,
            auto_approve_if_creator_is_approver: workflow.auto_approve_if_creator_is_approver,
            state_version: 0,
            updated_at: now,
            steps,
        };

        let _guard = self.locks.acquire(&request_id.0).await;
        let mut transition = Transition::new(request, &self.resolver, now);
        transition.start().await?;
        let output = transition.finish(true)?;
        let request = output.request.clone();

        self.commit(RequestWrite::Insert(output.request.clone()), output, None).await?;

        info!(
            event_name = "approval.request.submitted",
            correlation_id = %request.id.0,
            request_id = %request.id.0,
            workflow_id = %request.workflow_id.0,
            workflow_version = request.workflow_version,
            entity_type = %request.entity_type,
            status = request.overall_status.as_str(),
            "approval request submitted"
        );
        Ok(request)
    }

    pub async fn approve(
        &self,
        actor: &Actor,
        request_id: &RequestId,
        step_id: &StepId,
        notes: Option<String>,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.decide(actor, request_id, step_id, ActionKind::Approve, notes).await
    }

    pub async fn reject(
        &self,
        actor: &Actor,
        request_id: &RequestId,
        step_id: &StepId,
        notes: Option<String>,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.decide(actor, request_id, step_id, ActionKind::Reject, notes).await
    }

    pub async fn decide(
        &self,
        actor: &Actor,
        request_id: &RequestId,
        step_id: &StepId,
        action: ActionKind,
        notes: Option<String>,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let notes = notes.map(|notes| notes.trim().to_string()).filter(|notes| !notes.is_empty());
        self.execute(actor, request_id, Command::Decide { step_id: step_id.clone(), action, notes })
            .await
    }

    pub async fn comment(
        &self,
        actor: &Actor,
        request_id: &RequestId,
        step_id: Option<StepId>,
        comments: String,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.execute(actor, request_id, Command::Comment { step_id, comments }).await
    }

    pub async fn delegate(
        &self,
        actor: &Actor,
        request_id: &RequestId,
        step_id: &StepId,
        from: Option<String>,
        to: String,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.execute(actor, request_id, Command::Delegate { step_id: step_id.clone(), from, to })
            .await
    }

    pub async fn cancel(
        &self,
        actor: &Actor,
        request_id: &RequestId,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.execute(actor, request_id, Command::Cancel { reason }).await
    }

    pub async fn re_resolve(
        &self,
        actor: &Actor,
        request_id: &RequestId,
        step_id: &StepId,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.execute(actor, request_id, Command::ReResolve { step_id: step_id.clone() }).await
    }

    /// Auto-approves a timed-out step as the system actor, or drops the timer
    /// when the step was decided in the meantime.
    pub async fn fire_timeout(&self, step_id: &StepId) -> Result<TimeoutOutcome, ApplicationError> {
        let Some(request) = self.store.find_request_by_step(step_id).await? else {
            self.timers.clear_timer(step_id).await?;
            return Ok(TimeoutOutcome::Stale);
        };

        let (_, outcome) = self
            .run(&Actor::system(), &request.id, Command::Timeout { step_id: step_id.clone() })
            .await?;
        if outcome == Outcome::NoOp {
            self.timers.clear_timer(step_id).await?;
            return Ok(TimeoutOutcome::Stale);
        }
        Ok(TimeoutOutcome::AutoApproved)
    }

    pub async fn get(
        &self,
        actor: &Actor,
        request_id: &RequestId,
    ) -> Result<RequestView, ApplicationError> {
        let request = self.load(actor, request_id).await?;
        let actions = self.store.list_actions(request_id).await?;
        Ok(RequestView { request, actions })
    }

    pub async fn list(
        &self,
        actor: &Actor,
        query: RequestQuery,
    ) -> Result<Vec<ApprovalRequest>, ApplicationError> {
        let filter = RequestFilter {
            tenant_id: actor.tenant_id().map(str::to_string),
            status: query.status,
            entity_type: query.entity_type.filter(|entity| !entity.trim().is_empty()),
            limit: if query.approver.is_some() { None } else { query.limit },
        };
        let mut requests = self.store.list_requests(&filter).await?;

        if let Some(approver) = query.approver.filter(|approver| !approver.trim().is_empty()) {
            requests.retain(|request| request.awaits(&approver));
            if let Some(limit) = query.limit {
                requests.truncate(limit as usize);
            }
        }
        Ok(requests)
    }

    pub async fn verify_ledger(
        &self,
        request_id: &RequestId,
    ) -> Result<VerificationResult, ApplicationError> {
        let actions = self.store.list_actions(request_id).await?;
        Ok(ledger::verify_chain(request_id, &actions))
    }

    async fn load(
        &self,
        actor: &Actor,
        request_id: &RequestId,
    ) -> Result<ApprovalRequest, ApplicationError> {
        self.store
            .find_request(request_id)
            .await?
            .filter(|request| actor.can_see(request))
            .ok_or_else(|| {
                DomainError::NotFound { entity: "approval_request", id: request_id.0.clone() }.into()
            })
    }

    async fn execute(
        &self,
        actor: &Actor,
        request_id: &RequestId,
        command: Command,
    ) -> Result<ApprovalRequest, ApplicationError> {
        let (request, _) = self.run(actor, request_id, command).await?;
        Ok(request)
    }

    /// Load, transition and commit under the request lock, retrying when another
    /// writer committed first. The outcome is the one the committed attempt saw.
    async fn run(
        &self,
        actor: &Actor,
        request_id: &RequestId,
        command: Command,
    ) -> Result<(ApprovalRequest, Outcome), ApplicationError> {
        let _guard = self.locks.acquire(&request_id.0).await;
        let mut attempt = 1;

        loop {
            let request = self.load(actor, request_id).await?;
            let expected_version = request.state_version;
            let mut transition = Transition::new(request, &self.resolver, self.clock.now());
            let outcome = transition.apply(actor, &command).await?;

            let output = transition.finish(outcome == Outcome::Changed)?;
            let write = match &outcome {
                Outcome::NoOp => return Ok((output.request, Outcome::NoOp)),
                Outcome::Changed => {
                    RequestWrite::Update { request: output.request.clone(), expected_version }
                }
                Outcome::Recorded | Outcome::AlreadyDecided { .. } => RequestWrite::Unchanged,
            };
            let request = output.request.clone();

            match self.commit(write, output, Some(request_id)).await {
                Ok(()) => {}
                Err(StoreError::Conflict { .. }) if attempt < MAX_COMMIT_ATTEMPTS => {
                    warn!(
                        event_name = "approval.transition.conflict",
                        correlation_id = %request_id.0,
                        request_id = %request_id.0,
                        command = command.name(),
                        attempt,
                        "request changed underneath transition; retrying"
                    );
                    attempt += 1;
                    continue;
                }
                Err(error) => return Err(error.into()),
            }

            info!(
                event_name = "approval.transition.committed",
                correlation_id = %request_id.0,
                request_id = %request_id.0,
                command = command.name(),
                actor = %actor.email(),
                status = request.overall_status.as_str(),
                state_version = request.state_version,
                "approval transition committed"
            );

            if let Outcome::AlreadyDecided { step_id } = &outcome {
                return Err(DomainError::AlreadyDecided {
                    request_id: request_id.clone(),
                    step_id: step_id.clone(),
                }
                .into());
            }
            return Ok((request, outcome));
        }
    }

    async fn commit(
        &self,
        write: RequestWrite,
        output: TransitionOutput,
        existing: Option<&RequestId>,
    ) -> Result<(), StoreError> {
        let tail = match existing {
            Some(request_id) => LedgerTail::of(&self.store.list_actions(request_id).await?),
            None => None,
        };
        let actions = ledger::seal(output.drafts, tail);
        self.store.commit(TransitionCommit { request: write, actions, timers: output.timers }).await?;

        for trigger in output.triggers {
            self.notifier.notify(trigger);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration, TimeZone, Utc};

    use super::{ApprovalService, NewApprovalRequest, RequestQuery, TimeoutOutcome};
    use crate::approvals::lifecycle::{Actor, SYSTEM_ACTOR, TIMEOUT_COMMENT};
    use crate::approvals::resolver::InMemoryIdentityDirectory;
    use crate::clock::{Clock, ManualClock};
    use crate::domain::action::ActionKind;
    use crate::domain::request::{ApprovalRequest, Decision, RequestStatus, StepStatus};
    use crate::domain::workflow::{StepTemplate, WorkflowDefinition, WorkflowId};
    use crate::errors::{ApplicationError, DomainError};
    use crate::notifications::{InMemoryNotificationSink, NotificationTrigger};
    use crate::store::{InMemoryApprovalStore, TimerStore, WorkflowStore};

    const TENANT: &str = "tenant-a";

    struct Harness {
        service: ApprovalService,
        store: Arc<InMemoryApprovalStore>,
        directory: InMemoryIdentityDirectory,
        sink: InMemoryNotificationSink,
        clock: ManualClock,
    }

    fn directory() -> InMemoryIdentityDirectory {
        InMemoryIdentityDirectory::default()
            .with_role(TENANT, "manager", &["mia@example.com"])
            .with_role(TENANT, "ciso", &["cy@example.com"])
            .with_role(
                TENANT,
                "risk_committee",
                &["ana@example.com", "bo@example.com", "cara@example.com"],
            )
    }

    fn harness_with(directory: InMemoryIdentityDirectory) -> Harness {
        let store = Arc::new(InMemoryApprovalStore::default());
        let sink = InMemoryNotificationSink::default();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap());
        let service = ApprovalService::new(
            store.clone(),
            store.clone(),
            store.clone(),
            Arc::new(directory.clone()),
            Arc::new(sink.clone()),
            Arc::new(clock.clone()),
        );
        Harness { service, store, directory, sink, clock }
    }

    fn harness() -> Harness {
        harness_with(directory())
    }

    async fn install(harness: &Harness, steps: Vec<StepTemplate>, tweak: impl FnOnce(&mut WorkflowDefinition)) -> WorkflowId {
        let now = harness.clock.now();
        let mut workflow = WorkflowDefinition {
            id: WorkflowId("WF-policy".to_string()),
            tenant_id: TENANT.to_string(),
            name: "Policy sign-off".to_string(),
            description: None,
            trigger_entity_type: "policy".to_string(),
            steps,
            require_all_approvers: false,
            allow_parallel_approval: false,
            auto_approve_if_creator_is_approver: false,
            is_active: true,
            version: 1,
            created_by: "admin@example.com".to_string(),
            created_at: now,
            updated_at: now,
            archived_at: None,
        };
        tweak(&mut workflow);
        workflow.normalize();
        harness.store.save_workflow(workflow.clone(), None).await.expect("save workflow");
        workflow.id
    }

    fn submission(workflow_id: &WorkflowId) -> NewApprovalRequest {
        NewApprovalRequest {
            workflow_id: workflow_id.clone(),
            entity_type: "Policy".to_string(),
            entity_id: "POL-7".to_string(),
            request_title: "Acceptable use policy v3".to_string(),
            request_description: Some("Annual refresh".to_string()),
            entity_data: Some(serde_json::json!({"version": 3})),
            expires_at: None,
        }
    }

    fn user(email: &str) -> Actor {
        Actor::user(TENANT, email)
    }

    fn assert_terminal_has_no_open_steps(request: &ApprovalRequest) {
        assert!(request.is_terminal());
        assert!(request
            .steps
            .iter()
            .all(|step| !matches!(step.step_status, StepStatus::Pending | StepStatus::InProgress)));
    }

    #[tokio::test]
    async fn manager_then_ciso_rejection_scenario() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![
                StepTemplate::role(1, "Manager review", &["manager"]),
                StepTemplate::role(2, "CISO review", &["ciso"]),
            ],
            |_| {},
        )
        .await;

        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        assert_eq!(request.overall_status, RequestStatus::InProgress);
        assert_eq!(request.steps[0].step_status, StepStatus::InProgress);
        assert_eq!(request.steps[1].step_status, StepStatus::Pending);

        let step_one = request.steps[0].id.clone();
        let request = harness
            .service
            .approve(&user("mia@example.com"), &request.id, &step_one, None)
            .await
            .expect("manager approves");
        assert_eq!(request.steps[0].step_status, StepStatus::Approved);
        assert_eq!(request.steps[1].step_status, StepStatus::InProgress);
        assert_eq!(request.current_step_number, 2);

        let step_two = request.steps[1].id.clone();
        let request = harness
            .service
            .reject(
                &user("cy@example.com"),
                &request.id,
                &step_two,
                Some("insufficient evidence".to_string()),
            )
            .await
            .expect("ciso rejects");

        assert_eq!(request.overall_status, RequestStatus::Rejected);
        assert_eq!(request.final_decision, Some(Decision::Rejected));
        assert_eq!(request.final_decision_by.as_deref(), Some("cy@example.com"));
        assert_eq!(request.final_decision_notes.as_deref(), Some("insufficient evidence"));
        assert_terminal_has_no_open_steps(&request);

        let view = harness.service.get(&user("rick@example.com"), &request.id).await.expect("get");
        assert_eq!(view.actions.len(), 2);
        assert_eq!(view.actions[0].action, ActionKind::Approve);
        assert_eq!(view.actions[1].action, ActionKind::Reject);
        assert!(harness.service.verify_ledger(&request.id).await.expect("verify").valid);
    }

    #[tokio::test]
    async fn rejection_skips_later_steps_even_when_all_must_approve() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![
                StepTemplate::role(1, "Committee", &["risk_committee"]),
                StepTemplate::role(2, "CISO", &["ciso"]),
                StepTemplate::role(3, "Manager", &["manager"]).optional(),
            ],
            |workflow| workflow.require_all_approvers = true,
        )
        .await;

        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let step_one = request.steps[0].id.clone();
        harness
            .service
            .approve(&user("ana@example.com"), &request.id, &step_one, None)
            .await
            .expect("first approval");
        let request = harness
            .service
            .reject(&user("bo@example.com"), &request.id, &step_one, Some("veto".to_string()))
            .await
            .expect("veto");

        assert_eq!(request.overall_status, RequestStatus::Rejected);
        assert_eq!(request.steps[0].step_status, StepStatus::Rejected);
        assert_eq!(request.steps[1].step_status, StepStatus::Skipped);
        assert_eq!(request.steps[2].step_status, StepStatus::Skipped);
        assert!(harness.store.timers().await.is_empty());
    }

    #[tokio::test]
    async fn require_all_waits_for_every_committee_member() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![StepTemplate::role(1, "Committee", &["risk_committee"])],
            |workflow| workflow.require_all_approvers = true,
        )
        .await;

        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let step = request.steps[0].id.clone();

        let request = harness
            .service
            .approve(&user("ana@example.com"), &request.id, &step, None)
            .await
            .expect("ana");
        assert_eq!(request.overall_status, RequestStatus::InProgress);

        let request = harness
            .service
            .approve(&user("bo@example.com"), &request.id, &step, None)
            .await
            .expect("bo");
        assert_eq!(request.steps[0].step_status, StepStatus::InProgress);

        let request = harness
            .service
            .approve(&user("cara@example.com"), &request.id, &step, None)
            .await
            .expect("cara");
        assert_eq!(request.steps[0].step_status, StepStatus::Approved);
        assert_eq!(request.overall_status, RequestStatus::Approved);
        assert_eq!(request.final_decision_by.as_deref(), Some("cara@example.com"));
    }

    #[tokio::test]
    async fn first_approval_resolves_step_without_require_all() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![StepTemplate::role(1, "Committee", &["risk_committee"])],
            |_| {},
        )
        .await;

        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let step = request.steps[0].id.clone();
        let request = harness
            .service
            .approve(&user("bo@example.com"), &request.id, &step, Some("fine".to_string()))
            .await
            .expect("approve");

        assert_eq!(request.overall_status, RequestStatus::Approved);
        assert_eq!(request.final_decision, Some(Decision::Approved));
        assert_eq!(request.final_decision_notes.as_deref(), Some("fine"));
    }

    #[tokio::test]
    async fn late_decision_is_logged_as_comment_and_reported() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![StepTemplate::role(1, "Committee", &["risk_committee"])],
            |_| {},
        )
        .await;

        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let step = request.steps[0].id.clone();
        harness
            .service
            .approve(&user("ana@example.com"), &request.id, &step, None)
            .await
            .expect("approve");

        let error = harness
            .service
            .reject(&user("bo@example.com"), &request.id, &step, Some("too late".to_string()))
            .await
            .expect_err("already decided");
        assert!(error.is_already_decided());

        let view = harness.service.get(&user("bo@example.com"), &request.id).await.expect("get");
        assert_eq!(view.request.overall_status, RequestStatus::Approved);
        let last = view.actions.last().expect("late entry recorded");
        assert_eq!(last.action, ActionKind::Comment);
        assert_eq!(last.intended_action, Some(ActionKind::Reject));
        assert_eq!(last.sequence, 2);
    }

    #[tokio::test]
    async fn outsiders_are_rejected_before_the_ledger() {
        let harness = harness();
        let workflow_id =
            install(&harness, vec![StepTemplate::role(1, "Manager", &["manager"])], |_| {}).await;
        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let step = request.steps[0].id.clone();

        let error = harness
            .service
            .approve(&user("eve@example.com"), &request.id, &step, None)
            .await
            .expect_err("not an approver");

        assert!(matches!(error, ApplicationError::Domain(DomainError::NotAuthorized { .. })));
        let view = harness.service.get(&user("rick@example.com"), &request.id).await.expect("get");
        assert!(view.actions.is_empty());
    }

    #[tokio::test]
    async fn acting_on_a_pending_step_is_a_conflict() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![
                StepTemplate::role(1, "Manager", &["manager"]),
                StepTemplate::role(2, "CISO", &["ciso"]),
            ],
            |_| {},
        )
        .await;
        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");

        let error = harness
            .service
            .approve(&user("cy@example.com"), &request.id, &request.steps[1].id, None)
            .await
            .expect_err("step 2 is pending");

        assert!(matches!(error, ApplicationError::Domain(DomainError::StepNotActive { .. })));
    }

    #[tokio::test]
    async fn submission_validates_workflow_state() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![StepTemplate::role(1, "Manager", &["manager"])],
            |workflow| workflow.is_active = false,
        )
        .await;

        let error = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect_err("inactive workflow");
        assert!(matches!(error, ApplicationError::Domain(DomainError::Validation(_))));

        let mut wrong_type = submission(&workflow_id);
        wrong_type.entity_type = "vendor".to_string();
        let error = harness
            .service
            .submit(&user("rick@example.com"), wrong_type)
            .await
            .expect_err("mismatched entity");
        assert!(matches!(error, ApplicationError::Domain(DomainError::Validation(_))));

        let error = harness
            .service
            .submit(&Actor::user("tenant-b", "rick@example.com"), submission(&workflow_id))
            .await
            .expect_err("foreign tenant");
        assert!(matches!(error, ApplicationError::Domain(DomainError::NotFound { .. })));

        let listed = harness
            .service
            .list(&user("rick@example.com"), RequestQuery::default())
            .await
            .expect("list");
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn timeout_auto_approves_as_system_actor() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![StepTemplate::users(1, "Owner", &["owner@example.com"]).with_auto_approve_hours(0.001)],
            |_| {},
        )
        .await;
        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let step = request.steps[0].id.clone();

        let timers = harness.store.timers().await;
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].fire_at, request.steps[0].started_at.unwrap() + Duration::milliseconds(3600));
        assert_eq!(timers[0].created_at, harness.clock.now());

        harness.clock.advance(Duration::seconds(4));
        let outcome = harness.service.fire_timeout(&step).await.expect("fire");
        assert_eq!(outcome, TimeoutOutcome::AutoApproved);

        let view = harness.service.get(&user("rick@example.com"), &request.id).await.expect("get");
        assert_eq!(view.request.overall_status, RequestStatus::Approved);
        assert_eq!(view.request.steps[0].decision_by.as_deref(), Some(SYSTEM_ACTOR));
        assert_eq!(view.actions.len(), 1);
        assert_eq!(view.actions[0].approver_email, SYSTEM_ACTOR);
        assert_eq!(view.actions[0].comments.as_deref(), Some(TIMEOUT_COMMENT));
        assert!(harness.store.timers().await.is_empty());
    }

    #[tokio::test]
    async fn timeout_after_rejection_is_a_no_op() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![StepTemplate::role(1, "Manager", &["manager"]).with_auto_approve_hours(1.0)],
            |_| {},
        )
        .await;
        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let step = request.steps[0].id.clone();
        let rejected = harness
            .service
            .reject(&user("mia@example.com"), &request.id, &step, None)
            .await
            .expect("reject");

        let outcome = harness.service.fire_timeout(&step).await.expect("fire");
        assert_eq!(outcome, TimeoutOutcome::Stale);

        let view = harness.service.get(&user("rick@example.com"), &request.id).await.expect("get");
        assert_eq!(view.request, rejected);
        assert_eq!(view.actions.len(), 1);
        assert!(harness.store.find_timer(&step).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn decision_landing_while_timeout_waits_for_the_lock_leaves_it_stale() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![StepTemplate::role(1, "Manager", &["manager"]).with_auto_approve_hours(1.0)],
            |_| {},
        )
        .await;
        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let step = request.steps[0].id.clone();
        harness.clock.advance(Duration::hours(2));

        // A second service shares the store but not the lock table.
        let other = ApprovalService::new(
            harness.store.clone(),
            harness.store.clone(),
            harness.store.clone(),
            Arc::new(harness.directory.clone()),
            Arc::new(harness.sink.clone()),
            Arc::new(harness.clock.clone()),
        );

        let guard = harness.service.locks.acquire(&request.id.0).await;
        let mut fire = Box::pin(harness.service.fire_timeout(&step));
        let parked = tokio::time::timeout(std::time::Duration::from_millis(20), &mut fire).await;
        assert!(parked.is_err(), "timeout must wait for the request lock");

        let rejected = other
            .reject(&user("mia@example.com"), &request.id, &step, Some("not this quarter".to_string()))
            .await
            .expect("reject");
        drop(guard);

        let outcome = fire.await.expect("fire");
        assert_eq!(outcome, TimeoutOutcome::Stale);

        let view = harness.service.get(&user("rick@example.com"), &request.id).await.expect("get");
        assert_eq!(view.request, rejected);
        assert_eq!(view.actions.len(), 1);
        assert_eq!(view.actions[0].approver_email, "mia@example.com");
        assert!(harness.store.find_timer(&step).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn cancelling_twice_is_idempotent() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![StepTemplate::role(1, "Manager", &["manager"]).with_auto_approve_hours(8.0)],
            |_| {},
        )
        .await;
        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");

        let error = harness
            .service
            .cancel(&user("mia@example.com"), &request.id, None)
            .await
            .expect_err("approver cannot cancel");
        assert!(matches!(error, ApplicationError::Domain(DomainError::NotAuthorized { .. })));

        let cancelled = harness
            .service
            .cancel(&user("rick@example.com"), &request.id, Some("superseded".to_string()))
            .await
            .expect("cancel");
        assert_eq!(cancelled.overall_status, RequestStatus::Cancelled);
        assert_eq!(cancelled.final_decision, Some(Decision::Cancelled));
        assert_terminal_has_no_open_steps(&cancelled);
        assert!(harness.store.timers().await.is_empty());

        let again = harness
            .service
            .cancel(&Actor::admin(TENANT, "admin@example.com"), &request.id, None)
            .await
            .expect("second cancel");
        assert_eq!(again, cancelled);

        let outsider = harness
            .service
            .cancel(&user("mia@example.com"), &request.id, None)
            .await
            .expect("cancel on a closed request is a no-op for any caller");
        assert_eq!(outsider, cancelled);

        let view = harness.service.get(&user("rick@example.com"), &request.id).await.expect("get");
        assert_eq!(view.actions.len(), 1);
    }

    #[tokio::test]
    async fn creator_who_is_an_approver_is_approved_implicitly() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![
                StepTemplate::role(1, "Manager", &["manager"]),
                StepTemplate::role(2, "CISO", &["ciso"]),
            ],
            |workflow| workflow.auto_approve_if_creator_is_approver = true,
        )
        .await;

        let request = harness
            .service
            .submit(&user("mia@example.com"), submission(&workflow_id))
            .await
            .expect("submit");

        assert_eq!(request.steps[0].step_status, StepStatus::Approved);
        assert_eq!(request.steps[0].decision_by.as_deref(), Some("mia@example.com"));
        assert_eq!(request.steps[1].step_status, StepStatus::InProgress);

        let view = harness.service.get(&user("mia@example.com"), &request.id).await.expect("get");
        assert_eq!(view.actions.len(), 1);
        assert_eq!(view.actions[0].approver_email, "mia@example.com");
    }

    #[tokio::test]
    async fn parallel_workflow_activates_everything_and_skips_leftover_optional_steps() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![
                StepTemplate::role(1, "Manager", &["manager"]),
                StepTemplate::role(2, "CISO", &["ciso"]),
                StepTemplate::role(3, "Committee", &["risk_committee"]).optional(),
            ],
            |workflow| workflow.allow_parallel_approval = true,
        )
        .await;

        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        assert!(request.steps.iter().all(|step| step.step_status == StepStatus::InProgress));

        let request = harness
            .service
            .approve(&user("cy@example.com"), &request.id, &request.steps[1].id, None)
            .await
            .expect("ciso first");
        assert_eq!(request.overall_status, RequestStatus::InProgress);

        let request = harness
            .service
            .approve(&user("mia@example.com"), &request.id, &request.steps[0].id, None)
            .await
            .expect("manager");
        assert_eq!(request.overall_status, RequestStatus::Approved);
        assert_eq!(request.steps[2].step_status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn unresolvable_required_step_waits_for_an_administrator() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![
                StepTemplate::role(1, "Legal", &["legal"]).optional(),
                StepTemplate::role(2, "Auditor", &["auditor"]),
            ],
            |_| {},
        )
        .await;

        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        assert_eq!(request.steps[0].step_status, StepStatus::Skipped);
        assert_eq!(request.steps[1].step_status, StepStatus::InProgress);
        assert!(request.steps[1].resolution_error.is_some());
        assert!(harness
            .sink
            .triggers()
            .iter()
            .any(|trigger| matches!(trigger, NotificationTrigger::ResolutionFailed { .. })));

        let step = request.steps[1].id.clone();
        let error = harness
            .service
            .delegate(&user("rick@example.com"), &request.id, &step, None, "al@example.com".to_string())
            .await
            .expect_err("only admins route unresolved steps");
        assert!(matches!(error, ApplicationError::Domain(DomainError::NotAuthorized { .. })));

        let request = harness
            .service
            .delegate(
                &Actor::admin(TENANT, "admin@example.com"),
                &request.id,
                &step,
                None,
                "al@example.com".to_string(),
            )
            .await
            .expect("admin assigns");
        assert!(request.steps[1].resolution_error.is_none());

        let request = harness
            .service
            .approve(&user("al@example.com"), &request.id, &step, None)
            .await
            .expect("auditor approves");
        assert_eq!(request.overall_status, RequestStatus::Approved);
    }

    #[tokio::test]
    async fn re_resolve_picks_up_new_role_members() {
        let harness = harness();
        let workflow_id =
            install(&harness, vec![StepTemplate::role(1, "Auditor", &["auditor"])], |_| {}).await;
        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let step = request.steps[0].id.clone();
        let admin = Actor::admin(TENANT, "admin@example.com");

        let error = harness
            .service
            .re_resolve(&admin, &request.id, &step)
            .await
            .expect_err("still nobody");
        assert!(matches!(error, ApplicationError::Domain(DomainError::Resolution { .. })));

        let error = harness
            .service
            .re_resolve(&user("rick@example.com"), &request.id, &step)
            .await
            .expect_err("admin only");
        assert!(matches!(error, ApplicationError::Domain(DomainError::NotAuthorized { .. })));

        harness.directory.add_members(TENANT, "auditor", &["al@example.com"]);
        let request =
            harness.service.re_resolve(&admin, &request.id, &step).await.expect("re-resolve");

        assert!(request.steps[0].resolution_error.is_none());
        assert!(request.steps[0].resolved_approvers.contains("al@example.com"));
        assert!(request.awaits("al@example.com"));
    }

    #[tokio::test]
    async fn delegate_acts_in_place_of_delegator() {
        let harness = harness();
        let workflow_id = install(
            &harness,
            vec![StepTemplate::role(1, "Committee", &["risk_committee"])],
            |workflow| workflow.require_all_approvers = true,
        )
        .await;
        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let step = request.steps[0].id.clone();

        harness
            .service
            .delegate(&user("ana@example.com"), &request.id, &step, None, "dan@example.com".to_string())
            .await
            .expect("delegate");
        for approver in ["dan@example.com", "bo@example.com"] {
            harness
                .service
                .approve(&user(approver), &request.id, &step, None)
                .await
                .expect("approve");
        }

        let awaiting = harness
            .service
            .list(
                &user("rick@example.com"),
                RequestQuery { approver: Some("cara@example.com".to_string()), ..RequestQuery::default() },
            )
            .await
            .expect("list");
        assert_eq!(awaiting.len(), 1);

        let request = harness
            .service
            .approve(&user("cara@example.com"), &request.id, &step, None)
            .await
            .expect("cara");
        assert_eq!(request.overall_status, RequestStatus::Approved);
        assert_eq!(request.steps[0].delegated_to.as_deref(), Some("dan@example.com"));

        let error = harness
            .service
            .approve(&user("ana@example.com"), &request.id, &step, None)
            .await
            .expect_err("slot already filled");
        assert!(error.is_already_decided());
    }

    #[tokio::test]
    async fn nobody_acts_or_receives_work_as_the_system_identity() {
        let harness = harness();
        let workflow_id = install(&harness, vec![StepTemplate::role(1, "Manager", &["manager"])], |_| {}).await;

        let error = harness
            .service
            .submit(&user("System"), submission(&workflow_id))
            .await
            .expect_err("reserved requester");
        assert!(matches!(error, ApplicationError::Domain(DomainError::NotAuthorized { .. })));

        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let step = request.steps[0].id.clone();

        let error = harness
            .service
            .delegate(&user("mia@example.com"), &request.id, &step, None, " System ".to_string())
            .await
            .expect_err("reserved delegate");
        assert!(matches!(error, ApplicationError::Domain(DomainError::Validation(_))));

        let error = harness
            .service
            .approve(&user("SYSTEM"), &request.id, &step, None)
            .await
            .expect_err("reserved approver");
        assert!(matches!(error, ApplicationError::Domain(DomainError::NotAuthorized { .. })));

        let view = harness.service.get(&user("rick@example.com"), &request.id).await.expect("get");
        assert_eq!(view.request, request);
        assert!(view.actions.is_empty());
    }

    #[tokio::test]
    async fn comments_never_change_state_and_work_on_closed_requests() {
        let harness = harness();
        let workflow_id =
            install(&harness, vec![StepTemplate::role(1, "Manager", &["manager"])], |_| {}).await;
        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");
        let cancelled = harness
            .service
            .cancel(&user("rick@example.com"), &request.id, None)
            .await
            .expect("cancel");

        let after = harness
            .service
            .comment(&user("auditor@example.com"), &request.id, None, "noted for Q2 review".to_string())
            .await
            .expect("comment");

        assert_eq!(after, cancelled);
        let view = harness.service.get(&user("rick@example.com"), &request.id).await.expect("get");
        assert_eq!(view.actions.len(), 2);
        assert_eq!(view.actions[1].comments.as_deref(), Some("noted for Q2 review"));
    }

    #[tokio::test]
    async fn failed_commit_leaves_request_untouched() {
        let harness = harness();
        let workflow_id =
            install(&harness, vec![StepTemplate::role(1, "Manager", &["manager"])], |_| {}).await;
        let request = harness
            .service
            .submit(&user("rick@example.com"), submission(&workflow_id))
            .await
            .expect("submit");

        harness.store.fail_next_commits(1);
        let error = harness
            .service
            .approve(&user("mia@example.com"), &request.id, &request.steps[0].id, None)
            .await
            .expect_err("commit fails");
        assert!(matches!(error, ApplicationError::Persistence(_)));

        let view = harness.service.get(&user("rick@example.com"), &request.id).await.expect("get");
        assert_eq!(view.request, request);
        assert!(view.actions.is_empty());
    }
}
