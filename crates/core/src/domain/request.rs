use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::normalize_key;
use crate::domain::workflow::{ApproverType, StepTemplate, WorkflowId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepId(pub String);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Cancelled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match normalize_key(value).as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Cancelled)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Approved,
    Rejected,
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match normalize_key(value).as_str() {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "skipped" => Some(Self::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Approved | Self::Rejected | Self::Skipped)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    Rejected,
    Cancelled,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match normalize_key(value).as_str() {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub id: StepId,
    pub request_id: RequestId,
    pub step_number: u32,
    pub step_name: String,
    pub approver_type: ApproverType,
    pub approver_roles: BTreeSet<String>,
    pub approver_emails: BTreeSet<String>,
    pub resolved_approvers: BTreeSet<String>,
    /// delegate -> delegator
    pub delegations: BTreeMap<String, String>,
    pub approvals: BTreeSet<String>,
    pub step_status: StepStatus,
    pub decision: Option<Decision>,
    pub decision_by: Option<String>,
    pub decision_at: Option<DateTime<Utc>>,
    pub decision_notes: Option<String>,
    pub delegated_to: Option<String>,
    pub delegated_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub is_required: bool,
    pub auto_approve_hours: Option<f64>,
    pub resolution_error: Option<String>,
}

impl ApprovalStep {
    pub fn from_template(id: StepId, request_id: RequestId, template: &StepTemplate) -> Self {
        Self {
            id,
            request_id,
            step_number: template.step_number,
            step_name: template.step_name.clone(),
            approver_type: template.approver_type,
            approver_roles: template.approver_roles.clone(),
            approver_emails: template.approver_emails.clone(),
            resolved_approvers: BTreeSet::new(),
            delegations: BTreeMap::new(),
            approvals: BTreeSet::new(),
            step_status: StepStatus::Pending,
            decision: None,
            decision_by: None,
            decision_at: None,
            decision_notes: None,
            delegated_to: None,
            delegated_at: None,
            started_at: None,
            completed_at: None,
            is_required: template.required,
            auto_approve_hours: template.auto_approve_hours,
            resolution_error: None,
        }
    }

    /// Rebuilds the template this step was cloned from; used when re-running resolution.
    pub fn template(&self) -> StepTemplate {
        StepTemplate {
            step_number: self.step_number,
            step_name: self.step_name.clone(),
            approver_type: self.approver_type,
            approver_roles: self.approver_roles.clone(),
            approver_emails: self.approver_emails.clone(),
            required: self.is_required,
            auto_approve_hours: self.auto_approve_hours,
        }
    }

    pub fn is_eligible(&self, actor: &str) -> bool {
        let actor = normalize_key(actor);
        self.resolved_approvers.contains(&actor) || self.delegations.contains_key(&actor)
    }

    /// The resolved approver an action by `actor` counts for.
    pub fn approval_slot(&self, actor: &str) -> String {
        let actor = normalize_key(actor);
        if self.resolved_approvers.contains(&actor) {
            return actor;
        }
        self.delegations.get(&actor).cloned().unwrap_or(actor)
    }

    pub fn all_approvers_approved(&self) -> bool {
        !self.resolved_approvers.is_empty()
            && self.resolved_approvers.iter().all(|approver| self.approvals.contains(approver))
    }

    pub fn fire_at(&self) -> Option<DateTime<Utc>> {
        let started_at = self.started_at?;
        let hours = self.auto_approve_hours?;
        let millis = (hours * 3_600_000.0).round().max(1.0);
        if !millis.is_finite() || millis <= 0.0 || millis > i64::MAX as f64 {
            return None;
        }
        let delay = chrono::Duration::try_milliseconds(millis as i64)?;
        started_at.checked_add_signed(delay)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: RequestId,
    pub tenant_id: String,
    pub workflow_id: WorkflowId,
    pub workflow_version: u32,
    pub entity_type: String,
    pub entity_id: String,
    pub request_title: String,
    pub request_description: Option<String>,
    pub entity_snapshot: serde_json::Value,
    pub requested_by: String,
    pub requested_at: DateTime<Utc>,
    pub current_step_number: u32,
    pub overall_status: RequestStatus,
    pub expires_at: Option<DateTime<Utc>>,
    pub final_decision: Option<Decision>,
    pub final_decision_by: Option<String>,
    pub final_decision_notes: Option<String>,
    pub completed_at: Option<DateTime<Utc>>,
    pub require_all_approvers: bool,
    pub allow_parallel_approval: bool,
    pub auto_approve_if_creator_is_approver: bool,
    pub state_version: u32,
    pub updated_at: DateTime<Utc>,
    pub steps: Vec<ApprovalStep>,
}

impl ApprovalRequest {
    pub fn step(&self, step_id: &StepId) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| &step.id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &StepId) -> Option<&mut ApprovalStep> {
        self.steps.iter_mut().find(|step| &step.id == step_id)
    }

    pub fn step_by_number(&self, step_number: u32) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| step.step_number == step_number)
    }

    pub fn active_steps(&self) -> impl Iterator<Item = &ApprovalStep> {
        self.steps.iter().filter(|step| step.step_status == StepStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        self.overall_status.is_terminal()
    }

    /// Whether `actor` may currently act on any active step of this request.
    pub fn awaits(&self, actor: &str) -> bool {
        self.active_steps().any(|step| {
            step.is_eligible(actor)
                && !(self.require_all_approvers && step.approvals.contains(&step.approval_slot(actor)))
        })
    }
}

/// Overall status as a pure function of the step statuses.
pub fn derive_overall_status(steps: &[ApprovalStep]) -> RequestStatus {
    if steps.iter().any(|step| step.step_status == StepStatus::Rejected) {
        return RequestStatus::Rejected;
    }
    if steps.iter().any(|step| step.step_status == StepStatus::InProgress) {
        return RequestStatus::InProgress;
    }
    if steps.iter().any(|step| step.step_status == StepStatus::Pending) {
        let touched = steps.iter().any(|step| step.step_status != StepStatus::Pending);
        return if touched { RequestStatus::InProgress } else { RequestStatus::Pending };
    }

    let required_approved = steps
        .iter()
        .filter(|step| step.is_required)
        .all(|step| step.step_status == StepStatus::Approved);
    if required_approved && steps.iter().any(|step| step.is_required) {
        RequestStatus::Approved
    } else {
        RequestStatus::Cancelled
    }
}
