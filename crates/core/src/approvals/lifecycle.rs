//! Request lifecycle state machine.
//!
//! A [`Transition`] owns a working copy of one request and records everything a
//! command produces: the mutated request, ledger drafts, timer operations and
//! notification triggers. Nothing here touches storage; the service commits the
//! output as one unit or drops it.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::approvals::resolver::ApproverResolver;
use crate::domain::action::ActionKind;
use crate::domain::normalize_key;
use crate::domain::request::{
    derive_overall_status, ApprovalRequest, Decision, RequestStatus, StepId, StepStatus,
};
use crate::errors::{ApplicationError, DomainError};
use crate::ledger::ActionDraft;
use crate::notifications::NotificationTrigger;
use crate::store::TimerOp;

pub const SYSTEM_ACTOR: &str = "system";
pub const TIMEOUT_COMMENT: &str = "auto-approved: SLA exceeded";
pub const REQUESTER_APPROVAL_COMMENT: &str = "implicit approval: requester is a resolved approver";

/// Identity a command runs as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    email: String,
    tenant_id: Option<String>,
    is_admin: bool,
    is_system: bool,
}

impl Actor {
    pub fn user(tenant_id: &str, email: &str) -> Self {
        Self {
            email: normalize_key(email),
            tenant_id: Some(tenant_id.trim().to_string()),
            is_admin: false,
            is_system: false,
        }
    }

    pub fn admin(tenant_id: &str, email: &str) -> Self {
        Self { is_admin: true, ..Self::user(tenant_id, email) }
    }

    /// The synthetic actor timeouts decide as. Not bound to a tenant.
    pub fn system() -> Self {
        Self { email: SYSTEM_ACTOR.to_string(), tenant_id: None, is_admin: false, is_system: true }
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.tenant_id.as_deref()
    }

    pub fn is_admin(&self) -> bool {
        self.is_admin
    }

    pub fn is_system(&self) -> bool {
        self.is_system
    }

    pub fn can_see(&self, request: &ApprovalRequest) -> bool {
        self.tenant_id.as_deref().map_or(true, |tenant| tenant == request.tenant_id)
    }

    /// Human callers may not act under the identity timeouts decide as.
    pub fn ensure_not_impersonating(&self) -> Result<(), DomainError> {
        if !self.is_system && is_reserved_identity(&self.email) {
            return Err(DomainError::NotAuthorized {
                actor: self.email.clone(),
                reason: format!("`{SYSTEM_ACTOR}` is reserved for automatic decisions"),
            });
        }
        Ok(())
    }
}

pub fn is_reserved_identity(email: &str) -> bool {
    normalize_key(email) == SYSTEM_ACTOR
}

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Decide { step_id: StepId, action: ActionKind, notes: Option<String> },
    Comment { step_id: Option<StepId>, comments: String },
    Delegate { step_id: StepId, from: Option<String>, to: String },
    Cancel { reason: Option<String> },
    ReResolve { step_id: StepId },
    Timeout { step_id: StepId },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Decide { action: ActionKind::Reject, .. } => "reject",
            Self::Decide { .. } => "approve",
            Self::Comment { .. } => "comment",
            Self::Delegate { .. } => "delegate",
            Self::Cancel { .. } => "cancel",
            Self::ReResolve { .. } => "re_resolve",
            Self::Timeout { .. } => "timeout",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Request state moved; persist it with the ledger entries.
    Changed,
    /// Only ledger entries were produced.
    Recorded,
    /// A decisive action arrived after the step or request was decided.
    AlreadyDecided { step_id: StepId },
    /// Nothing to persist.
    NoOp,
}

#[derive(Clone, Debug)]
pub struct TransitionOutput {
    pub request: ApprovalRequest,
    pub drafts: Vec<ActionDraft>,
    pub timers: Vec<TimerOp>,
    pub triggers: Vec<NotificationTrigger>,
}

pub struct Transition<'a> {
    request: ApprovalRequest,
    resolver: &'a ApproverResolver,
    now: DateTime<Utc>,
    drafts: Vec<ActionDraft>,
    timers: Vec<TimerOp>,
    triggers: Vec<NotificationTrigger>,
}

impl<'a> Transition<'a> {
    pub fn new(request: ApprovalRequest, resolver: &'a ApproverResolver, now: DateTime<Utc>) -> Self {
        Self {
            request,
            resolver,
            now,
            drafts: Vec::new(),
            timers: Vec::new(),
            triggers: Vec::new(),
        }
    }

    pub fn request(&self) -> &ApprovalRequest {
        &self.request
    }

    /// Moves a freshly created request into `in_progress` and activates its first
    /// step, or every step when parallel approval is allowed.
    pub async fn start(&mut self) -> Result<(), ApplicationError> {
        if self.request.overall_status != RequestStatus::Pending {
            return Err(DomainError::InvariantViolation(format!(
                "request {} was already started",
                self.request.id.0
            ))
            .into());
        }
        self.request.overall_status = RequestStatus::InProgress;

        if self.request.allow_parallel_approval {
            let pending: Vec<StepId> = self
                .request
                .steps
                .iter()
                .filter(|step| step.step_status == StepStatus::Pending)
                .map(|step| step.id.clone())
                .collect();
            for step_id in pending {
                self.activate(&step_id).await?;
            }
        }

        self.advance().await
    }

    pub async fn apply(
        &mut self,
        actor: &Actor,
        command: &Command,
    ) -> Result<Outcome, ApplicationError> {
        actor.ensure_not_impersonating()?;
        match command {
            Command::Decide { step_id, action, notes } => {
                self.decide(actor, step_id, *action, notes.clone()).await
            }
            Command::Comment { step_id, comments } => {
                self.comment(actor, step_id.as_ref(), comments)
            }
            Command::Delegate { step_id, from, to } => {
                self.delegate(actor, step_id, from.as_deref(), to).await
            }
            Command::Cancel { reason } => self.cancel(actor, reason.clone()),
            Command::ReResolve { step_id } => self.re_resolve(actor, step_id).await,
            Command::Timeout { step_id } => {
                let active = !self.request.is_terminal()
                    && self
                        .request
                        .step(step_id)
                        .is_some_and(|step| step.step_status == StepStatus::InProgress);
                if !active {
                    return Ok(Outcome::NoOp);
                }
                self.decide(
                    &Actor::system(),
                    step_id,
                    ActionKind::Approve,
                    Some(TIMEOUT_COMMENT.to_string()),
                )
                .await
            }
        }
    }

    /// Re-derives the overall status, checks the request invariants and hands
    /// back everything the transition produced.
    pub fn finish(mut self, changed: bool) -> Result<TransitionOutput, ApplicationError> {
        if changed {
            self.request.overall_status = derive_overall_status(&self.request.steps);
            self.request.updated_at = self.now;
            self.request.state_version = self.request.state_version.saturating_add(1);
        }
        check_invariants(&self.request)?;

        Ok(TransitionOutput {
            request: self.request,
            drafts: self.drafts,
            timers: self.timers,
            triggers: self.triggers,
        })
    }

    async fn decide(
        &mut self,
        actor: &Actor,
        step_id: &StepId,
        action: ActionKind,
        notes: Option<String>,
    ) -> Result<Outcome, ApplicationError> {
        if !action.is_decisive() {
            return Err(DomainError::Validation(format!(
                "`{}` is not a decision",
                action.as_str()
            ))
            .into());
        }

        let step = self.request.step(step_id).ok_or_else(|| DomainError::NotFound {
            entity: "approval_step",
            id: step_id.0.clone(),
        })?;

        if step.step_status == StepStatus::Pending {
            return Err(DomainError::StepNotActive {
                step_id: step_id.clone(),
                status: step.step_status,
            }
            .into());
        }

        if !actor.is_system() && !step.is_eligible(actor.email()) {
            return Err(DomainError::NotAuthorized {
                actor: actor.email().to_string(),
                reason: format!("not an approver for step {}", step.step_number),
            }
            .into());
        }

        let slot =
            if actor.is_system() { SYSTEM_ACTOR.to_string() } else { step.approval_slot(actor.email()) };
        let late = self.request.is_terminal()
            || step.step_status != StepStatus::InProgress
            || (!actor.is_system() && step.approvals.contains(&slot));
        if late {
            let step_order = step.step_number;
            self.record(
                actor,
                Some(step_id.clone()),
                step_order,
                ActionKind::Comment,
                Some(action),
                notes,
            );
            return Ok(Outcome::AlreadyDecided { step_id: step_id.clone() });
        }

        match action {
            ActionKind::Reject => self.reject(actor, step_id, notes),
            _ => self.approve(actor, step_id, notes),
        }
        self.advance().await?;
        Ok(Outcome::Changed)
    }

    fn approve(&mut self, actor: &Actor, step_id: &StepId, notes: Option<String>) {
        let require_all = self.request.require_all_approvers;
        let Some(step) = self.request.step_mut(step_id) else {
            return;
        };
        let slot =
            if actor.is_system() { SYSTEM_ACTOR.to_string() } else { step.approval_slot(actor.email()) };
        step.approvals.insert(slot);
        let resolves = actor.is_system() || !require_all || step.all_approvers_approved();
        let step_order = step.step_number;

        self.record(actor, Some(step_id.clone()), step_order, ActionKind::Approve, None, notes.clone());
        if resolves {
            self.resolve_step(step_id, Decision::Approved, actor.email(), notes);
        }
    }

    fn reject(&mut self, actor: &Actor, step_id: &StepId, notes: Option<String>) {
        let step_order = self.request.step(step_id).map_or(0, |step| step.step_number);
        self.record(actor, Some(step_id.clone()), step_order, ActionKind::Reject, None, notes.clone());
        self.resolve_step(step_id, Decision::Rejected, actor.email(), notes.clone());
        self.complete(Decision::Rejected, Some(actor.email().to_string()), notes);
    }

    fn comment(
        &mut self,
        actor: &Actor,
        step_id: Option<&StepId>,
        comments: &str,
    ) -> Result<Outcome, ApplicationError> {
        let comments = comments.trim();
        if comments.is_empty() {
            return Err(DomainError::Validation("comments must not be blank".to_string()).into());
        }
        if actor.email().is_empty() {
            return Err(DomainError::Validation("commenter identity is required".to_string()).into());
        }

        let step_order = match step_id {
            Some(step_id) => {
                self.request
                    .step(step_id)
                    .ok_or_else(|| DomainError::NotFound {
                        entity: "approval_step",
                        id: step_id.0.clone(),
                    })?
                    .step_number
            }
            None => self.request.current_step_number,
        };

        self.record(
            actor,
            step_id.cloned(),
            step_order,
            ActionKind::Comment,
            None,
            Some(comments.to_string()),
        );
        Ok(Outcome::Recorded)
    }

    async fn delegate(
        &mut self,
        actor: &Actor,
        step_id: &StepId,
        from: Option<&str>,
        to: &str,
    ) -> Result<Outcome, ApplicationError> {
        let to = normalize_key(to);
        let from = normalize_key(from.unwrap_or(actor.email()));
        if to.is_empty() {
            return Err(DomainError::Validation("delegate must not be blank".to_string()).into());
        }
        if is_reserved_identity(&to) {
            return Err(DomainError::Validation(format!(
                "cannot delegate to the reserved `{SYSTEM_ACTOR}` identity"
            ))
            .into());
        }
        if to == from {
            return Err(
                DomainError::Validation("cannot delegate a step to the same approver".to_string())
                    .into(),
            );
        }

        let now = self.now;
        let step = self.request.step_mut(step_id).ok_or_else(|| DomainError::NotFound {
            entity: "approval_step",
            id: step_id.0.clone(),
        })?;
        if step.step_status != StepStatus::InProgress {
            return Err(DomainError::StepNotActive {
                step_id: step_id.clone(),
                status: step.step_status,
            }
            .into());
        }

        let stuck = step.resolution_error.is_some() && step.resolved_approvers.is_empty();
        let description = if stuck {
            if !actor.is_admin() {
                return Err(DomainError::NotAuthorized {
                    actor: actor.email().to_string(),
                    reason: "only administrators can route a step without approvers".to_string(),
                }
                .into());
            }
            step.resolved_approvers.insert(to.clone());
            step.resolution_error = None;
            format!("unresolved step assigned to {to}")
        } else {
            if actor.email() != from && !actor.is_admin() {
                return Err(DomainError::NotAuthorized {
                    actor: actor.email().to_string(),
                    reason: "only the approver or an administrator can delegate".to_string(),
                }
                .into());
            }
            if !step.is_eligible(&from) {
                return Err(DomainError::NotAuthorized {
                    actor: from.clone(),
                    reason: format!("not an approver for step {}", step.step_number),
                }
                .into());
            }
            if step.is_eligible(&to) {
                return Err(DomainError::Validation(format!(
                    "{to} can already act on step {}",
                    step.step_number
                ))
                .into());
            }
            let delegator = step.approval_slot(&from);
            step.delegations.insert(to.clone(), delegator);
            format!("delegated from {from} to {to}")
        };
        step.delegated_to = Some(to.clone());
        step.delegated_at = Some(now);
        let step_order = step.step_number;
        let auto_approve = self.request.auto_approve_if_creator_is_approver;
        let requester = normalize_key(&self.request.requested_by);

        self.record(
            actor,
            Some(step_id.clone()),
            step_order,
            ActionKind::Comment,
            None,
            Some(description),
        );

        if stuck && auto_approve && to == requester {
            let requester = Actor::user(&self.request.tenant_id, &requester);
            self.approve(&requester, step_id, Some(REQUESTER_APPROVAL_COMMENT.to_string()));
            self.advance().await?;
        }

        Ok(Outcome::Changed)
    }

    /// A closed request answers every cancel with itself, whoever asks.
    fn cancel(&mut self, actor: &Actor, reason: Option<String>) -> Result<Outcome, ApplicationError> {
        if self.request.is_terminal() {
            return Ok(Outcome::NoOp);
        }
        let requester = normalize_key(&self.request.requested_by);
        if !actor.is_admin() && actor.email() != requester {
            return Err(DomainError::NotAuthorized {
                actor: actor.email().to_string(),
                reason: "only the requester or an administrator can cancel".to_string(),
            }
            .into());
        }

        let reason = reason.map(|reason| reason.trim().to_string()).filter(|reason| !reason.is_empty());
        let comments = match &reason {
            Some(reason) => format!("request cancelled: {reason}"),
            None => "request cancelled".to_string(),
        };
        let step_order = self.request.current_step_number;
        self.record(actor, None, step_order, ActionKind::Comment, None, Some(comments));
        self.complete(Decision::Cancelled, Some(actor.email().to_string()), reason);
        Ok(Outcome::Changed)
    }

    async fn re_resolve(
        &mut self,
        actor: &Actor,
        step_id: &StepId,
    ) -> Result<Outcome, ApplicationError> {
        if !actor.is_admin() {
            return Err(DomainError::NotAuthorized {
                actor: actor.email().to_string(),
                reason: "re-resolving approvers requires an administrator".to_string(),
            }
            .into());
        }

        let step = self.request.step(step_id).ok_or_else(|| DomainError::NotFound {
            entity: "approval_step",
            id: step_id.0.clone(),
        })?;
        if step.step_status != StepStatus::InProgress {
            return Err(DomainError::StepNotActive {
                step_id: step_id.clone(),
                status: step.step_status,
            }
            .into());
        }
        if step.resolution_error.is_none() {
            return Err(DomainError::Validation(format!(
                "step {} already has resolved approvers",
                step.step_number
            ))
            .into());
        }

        let template = step.template();
        let step_order = step.step_number;
        let approvers = self.resolver.resolve(&template, &self.request.tenant_id).await?;
        if approvers.is_empty() {
            return Err(DomainError::Resolution {
                step_number: step_order,
                reason: "no approvers resolved".to_string(),
            }
            .into());
        }

        self.record(
            actor,
            Some(step_id.clone()),
            step_order,
            ActionKind::Comment,
            None,
            Some(format!("approvers re-resolved: {}", join(&approvers))),
        );
        self.install_approvers(step_id, approvers);
        self.advance().await?;
        Ok(Outcome::Changed)
    }

    /// Walks the request forward until it is waiting on someone or finished.
    async fn advance(&mut self) -> Result<(), ApplicationError> {
        loop {
            if self.request.is_terminal() {
                return Ok(());
            }

            if self.required_steps_approved() {
                let (by, notes) = self.last_approval();
                self.complete(Decision::Approved, by, notes);
                return Ok(());
            }

            if self.request.active_steps().next().is_some() {
                return Ok(());
            }

            let next = self
                .request
                .steps
                .iter()
                .filter(|step| step.step_status == StepStatus::Pending)
                .min_by_key(|step| step.step_number)
                .map(|step| (step.id.clone(), step.step_number));

            match next {
                Some((step_id, step_number)) => {
                    self.request.current_step_number = step_number;
                    self.activate(&step_id).await?;
                }
                None => {
                    let decision = match derive_overall_status(&self.request.steps) {
                        RequestStatus::Rejected => Decision::Rejected,
                        RequestStatus::Approved => Decision::Approved,
                        _ => Decision::Cancelled,
                    };
                    self.complete(decision, None, None);
                    return Ok(());
                }
            }
        }
    }

    async fn activate(&mut self, step_id: &StepId) -> Result<(), ApplicationError> {
        let Some(step) = self.request.step(step_id) else {
            return Err(DomainError::NotFound { entity: "approval_step", id: step_id.0.clone() }.into());
        };
        let template = step.template();
        let step_number = step.step_number;

        match self.resolver.resolve(&template, &self.request.tenant_id).await {
            Ok(approvers) if approvers.is_empty() => {
                if let Some(step) = self.request.step_mut(step_id) {
                    step.step_status = StepStatus::Skipped;
                }
                Ok(())
            }
            Ok(approvers) => {
                self.start_step(step_id);
                self.install_approvers(step_id, approvers);
                Ok(())
            }
            Err(ApplicationError::Domain(DomainError::Resolution { reason, .. })) => {
                self.start_step(step_id);
                if let Some(step) = self.request.step_mut(step_id) {
                    step.resolution_error = Some(reason.clone());
                }
                warn!(
                    event_name = "approval.step.resolution_failed",
                    request_id = %self.request.id.0,
                    step_id = %step_id.0,
                    step_number,
                    reason = %reason,
                    "required step activated without approvers"
                );
                self.triggers.push(NotificationTrigger::ResolutionFailed {
                    request_id: self.request.id.clone(),
                    step_id: step_id.clone(),
                    step_number,
                    reason,
                });
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    fn start_step(&mut self, step_id: &StepId) {
        let now = self.now;
        let request_id = self.request.id.clone();
        let Some(step) = self.request.step_mut(step_id) else {
            return;
        };
        step.step_status = StepStatus::InProgress;
        step.started_at = Some(now);
        step.completed_at = None;
        if let Some(fire_at) = step.fire_at() {
            self.timers.push(TimerOp::Schedule {
                step_id: step_id.clone(),
                request_id,
                fire_at,
                created_at: now,
            });
        }
    }

    fn install_approvers(
        &mut self,
        step_id: &StepId,
        approvers: std::collections::BTreeSet<String>,
    ) {
        let Some(step) = self.request.step_mut(step_id) else {
            return;
        };
        step.resolved_approvers = approvers.clone();
        step.resolution_error = None;
        let step_number = step.step_number;

        self.triggers.push(NotificationTrigger::StepActivated {
            request_id: self.request.id.clone(),
            step_id: step_id.clone(),
            step_number,
            approvers: approvers.clone(),
        });

        let requester = normalize_key(&self.request.requested_by);
        if self.request.auto_approve_if_creator_is_approver && approvers.contains(&requester) {
            let actor = Actor::user(&self.request.tenant_id, &requester);
            self.approve(&actor, step_id, Some(REQUESTER_APPROVAL_COMMENT.to_string()));
        }
    }

    fn resolve_step(
        &mut self,
        step_id: &StepId,
        decision: Decision,
        by: &str,
        notes: Option<String>,
    ) {
        let now = self.now;
        let Some(step) = self.request.step_mut(step_id) else {
            return;
        };
        step.step_status = match decision {
            Decision::Rejected => StepStatus::Rejected,
            _ => StepStatus::Approved,
        };
        step.decision = Some(decision);
        step.decision_by = Some(by.to_string());
        step.decision_at = Some(now);
        step.decision_notes = notes;
        step.completed_at = Some(now);
        if step.auto_approve_hours.is_some() {
            self.timers.push(TimerOp::Cancel { step_id: step_id.clone() });
        }
    }

    /// Closes the request: every open step is skipped and its timer cancelled.
    fn complete(&mut self, decision: Decision, by: Option<String>, notes: Option<String>) {
        let now = self.now;
        for step in &mut self.request.steps {
            match step.step_status {
                StepStatus::Pending => step.step_status = StepStatus::Skipped,
                StepStatus::InProgress => {
                    step.step_status = StepStatus::Skipped;
                    step.completed_at = Some(now);
                    if step.auto_approve_hours.is_some() {
                        self.timers.push(TimerOp::Cancel { step_id: step.id.clone() });
                    }
                }
                _ => {}
            }
        }

        let status = derive_overall_status(&self.request.steps);
        self.request.overall_status = status;
        self.request.final_decision = Some(decision);
        self.request.final_decision_by = by;
        self.request.final_decision_notes = notes;
        self.request.completed_at = Some(now);
        self.triggers.push(NotificationTrigger::RequestCompleted {
            request_id: self.request.id.clone(),
            status,
        });
    }

    fn required_steps_approved(&self) -> bool {
        let mut required = self.request.steps.iter().filter(|step| step.is_required).peekable();
        required.peek().is_some() && required.all(|step| step.step_status == StepStatus::Approved)
    }

    fn last_approval(&self) -> (Option<String>, Option<String>) {
        self.request
            .steps
            .iter()
            .filter(|step| step.step_status == StepStatus::Approved)
            .max_by_key(|step| (step.decision_at, step.step_number))
            .map(|step| (step.decision_by.clone(), step.decision_notes.clone()))
            .unwrap_or((None, None))
    }

    fn record(
        &mut self,
        actor: &Actor,
        step_id: Option<StepId>,
        step_order: u32,
        action: ActionKind,
        intended_action: Option<ActionKind>,
        comments: Option<String>,
    ) {
        self.drafts.push(ActionDraft {
            request_id: self.request.id.clone(),
            step_id: step_id.clone(),
            step_order,
            approver_email: actor.email().to_string(),
            action,
            intended_action,
            comments,
            action_date: self.now,
        });
        self.triggers.push(NotificationTrigger::DecisionRecorded {
            request_id: self.request.id.clone(),
            step_id,
            actor: actor.email().to_string(),
            action,
        });
    }
}

pub fn check_invariants(request: &ApprovalRequest) -> Result<(), DomainError> {
    let violation = |message: String| Err(DomainError::InvariantViolation(message));

    let derived = derive_overall_status(&request.steps);
    if request.overall_status != RequestStatus::Pending && request.overall_status != derived {
        return violation(format!(
            "request {} is {} but its steps derive {}",
            request.id.0,
            request.overall_status.as_str(),
            derived.as_str()
        ));
    }

    for step in &request.steps {
        if request.is_terminal()
            && matches!(step.step_status, StepStatus::Pending | StepStatus::InProgress)
        {
            return violation(format!(
                "terminal request {} still has step {} {}",
                request.id.0,
                step.step_number,
                step.step_status.as_str()
            ));
        }
        if step.step_status == StepStatus::InProgress
            && (step.started_at.is_none() || step.completed_at.is_some())
        {
            return violation(format!("step {} is in progress with bad timestamps", step.id.0));
        }
        if matches!(step.step_status, StepStatus::Approved | StepStatus::Rejected)
            && step.completed_at.is_none()
        {
            return violation(format!("decided step {} has no completed_at", step.id.0));
        }
    }

    Ok(())
}

fn join(values: &std::collections::BTreeSet<String>) -> String {
    values.iter().cloned().collect::<Vec<_>>().join(", ")
}
