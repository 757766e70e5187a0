use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::approvals::SYSTEM_ACTOR;
use crate::domain::normalize_key;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApproverType {
    Role,
    User,
}

impl ApproverType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Role => "role",
            Self::User => "user",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match normalize_key(value).as_str() {
            "role" => Some(Self::Role),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// Ten years. Longer SLAs are rejected rather than silently never firing.
pub const MAX_AUTO_APPROVE_HOURS: f64 = 87_600.0;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub step_number: u32,
    pub step_name: String,
    pub approver_type: ApproverType,
    #[serde(default)]
    pub approver_roles: BTreeSet<String>,
    #[serde(default)]
    pub approver_emails: BTreeSet<String>,
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub auto_approve_hours: Option<f64>,
}

fn default_required() -> bool {
    true
}

impl StepTemplate {
    pub fn role(step_number: u32, step_name: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            step_number,
            step_name: step_name.into(),
            approver_type: ApproverType::Role,
            approver_roles: roles.iter().map(|role| normalize_key(role)).collect(),
            approver_emails: BTreeSet::new(),
            required: true,
            auto_approve_hours: None,
        }
    }

    pub fn users(step_number: u32, step_name: impl Into<String>, emails: &[&str]) -> Self {
        Self {
            step_number,
            step_name: step_name.into(),
            approver_type: ApproverType::User,
            approver_roles: BTreeSet::new(),
            approver_emails: emails.iter().map(|email| normalize_key(email)).collect(),
            required: true,
            auto_approve_hours: None,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_auto_approve_hours(mut self, hours: f64) -> Self {
        self.auto_approve_hours = Some(hours);
        self
    }

    fn normalize(&mut self) {
        self.step_name = self.step_name.trim().to_string();
        self.approver_roles = self
            .approver_roles
            .iter()
            .map(|role| normalize_key(role))
            .filter(|role| !role.is_empty())
            .collect();
        self.approver_emails = self
            .approver_emails
            .iter()
            .map(|email| normalize_key(email))
            .filter(|email| !email.is_empty())
            .collect();
    }

    fn validate(&self) -> Result<(), WorkflowValidationError> {
        if self.step_name.is_empty() {
            return Err(WorkflowValidationError::BlankStepName { step_number: self.step_number });
        }

        let roles_set = !self.approver_roles.is_empty();
        let emails_set = !self.approver_emails.is_empty();
        let consistent = match self.approver_type {
            ApproverType::Role => roles_set && !emails_set,
            ApproverType::User => emails_set && !roles_set,
        };
        if !consistent {
            return Err(WorkflowValidationError::ApproverMismatch {
                step_number: self.step_number,
                approver_type: self.approver_type,
            });
        }

        if self.approver_emails.contains(SYSTEM_ACTOR) {
            return Err(WorkflowValidationError::ReservedApprover { step_number: self.step_number });
        }

        if let Some(hours) = self.auto_approve_hours {
            if !hours.is_finite() || hours <= 0.0 || hours > MAX_AUTO_APPROVE_HOURS {
                return Err(WorkflowValidationError::InvalidAutoApproveHours {
                    step_number: self.step_number,
                });
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub tenant_id: String,
    pub name: String,
    pub description: Option<String>,
    pub trigger_entity_type: String,
    pub steps: Vec<StepTemplate>,
    pub require_all_approvers: bool,
    pub allow_parallel_approval: bool,
    pub auto_approve_if_creator_is_approver: bool,
    pub is_active: bool,
    pub version: u32,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub archived_at: Option<DateTime<Utc>>,
}

impl WorkflowDefinition {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }

    pub fn accepts_entity_type(&self, entity_type: &str) -> bool {
        normalize_key(&self.trigger_entity_type) == normalize_key(entity_type)
    }

    pub fn step(&self, step_number: u32) -> Option<&StepTemplate> {
        self.steps.iter().find(|step| step.step_number == step_number)
    }

    /// Trims and lower-cases identities and orders steps by number.
    pub fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.trigger_entity_type = normalize_key(&self.trigger_entity_type);
        for step in &mut self.steps {
            step.normalize();
        }
        self.steps.sort_by_key(|step| step.step_number);
    }

    pub fn validate(&self) -> Result<(), WorkflowValidationError> {
        if self.name.trim().is_empty() {
            return Err(WorkflowValidationError::BlankName);
        }
        if self.tenant_id.trim().is_empty() {
            return Err(WorkflowValidationError::BlankTenant);
        }
        if self.trigger_entity_type.trim().is_empty() {
            return Err(WorkflowValidationError::BlankTriggerEntityType);
        }
        if self.steps.is_empty() {
            return Err(WorkflowValidationError::NoSteps);
        }

        for (index, step) in self.steps.iter().enumerate() {
            let expected = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
            if step.step_number != expected {
                return Err(WorkflowValidationError::NonContiguousSteps {
                    expected,
                    found: step.step_number,
                });
            }
            step.validate()?;
        }

        if !self.steps.iter().any(|step| step.required) {
            return Err(WorkflowValidationError::NoRequiredStep);
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WorkflowValidationError {
    #[error("workflow name must not be blank")]
    BlankName,
    #[error("workflow tenant must not be blank")]
    BlankTenant,
    #[error("workflow trigger_entity_type must not be blank")]
    BlankTriggerEntityType,
    #[error("workflow must define at least one step")]
    NoSteps,
    #[error("workflow must define at least one required step")]
    NoRequiredStep,
    #[error("step numbers must be contiguous from 1: expected {expected}, found {found}")]
    NonContiguousSteps { expected: u32, found: u32 },
    #[error("step {step_number} has a blank name")]
    BlankStepName { step_number: u32 },
    #[error("step {step_number} approvers do not match approver_type `{}`", .approver_type.as_str())]
    ApproverMismatch { step_number: u32, approver_type: ApproverType },
    #[error("step {step_number} auto_approve_hours must be positive and at most 87600 (ten years)")]
    InvalidAutoApproveHours { step_number: u32 },
    #[error("step {step_number} lists the reserved `system` identity as an approver")]
    ReservedApprover { step_number: u32 },
}
