use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::normalize_key;
use crate::domain::workflow::{ApproverType, StepTemplate};
use crate::errors::{ApplicationError, DomainError};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("identity directory unreachable: {0}")]
    Unavailable(String),
    #[error("identity directory rejected lookup for role `{role}`: {reason}")]
    Rejected { role: String, reason: String },
}

impl From<DirectoryError> for ApplicationError {
    fn from(value: DirectoryError) -> Self {
        Self::Integration(value.to_string())
    }
}

/// Role membership lookups against the tenant's identity service.
#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    async fn role_members(&self, tenant_id: &str, role: &str)
        -> Result<Vec<String>, DirectoryError>;
}

type RoleMembers = HashMap<(String, String), BTreeSet<String>>;

/// Clones share membership, so tests can change roles under a running service.
#[derive(Clone, Debug, Default)]
pub struct InMemoryIdentityDirectory {
    members: Arc<RwLock<RoleMembers>>,
    unavailable: bool,
}

impl InMemoryIdentityDirectory {
    pub fn with_role(self, tenant_id: &str, role: &str, members: &[&str]) -> Self {
        self.add_members(tenant_id, role, members);
        self
    }

    pub fn add_members(&self, tenant_id: &str, role: &str, members: &[&str]) {
        let mut roles = match self.members.write() {
            Ok(roles) => roles,
            Err(poisoned) => poisoned.into_inner(),
        };
        roles
            .entry((normalize_key(tenant_id), normalize_key(role)))
            .or_default()
            .extend(members.iter().map(|member| normalize_key(member)));
    }

    /// Every lookup fails as if the directory were down.
    pub fn unavailable() -> Self {
        Self { members: Arc::default(), unavailable: true }
    }
}

#[async_trait]
impl IdentityDirectory for InMemoryIdentityDirectory {
    async fn role_members(
        &self,
        tenant_id: &str,
        role: &str,
    ) -> Result<Vec<String>, DirectoryError> {
        if self.unavailable {
            return Err(DirectoryError::Unavailable("in-memory directory offline".to_string()));
        }
        let roles = match self.members.read() {
            Ok(roles) => roles,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(roles
            .get(&(normalize_key(tenant_id), normalize_key(role)))
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Expands a step template into the concrete approver set at activation time.
#[derive(Clone)]
pub struct ApproverResolver {
    directory: Arc<dyn IdentityDirectory>,
}

impl ApproverResolver {
    pub fn new(directory: Arc<dyn IdentityDirectory>) -> Self {
        Self { directory }
    }

    /// Returns an empty set for an optional step nobody can approve; the same
    /// situation on a required step is a [`DomainError::Resolution`].
    pub async fn resolve(
        &self,
        template: &StepTemplate,
        tenant_id: &str,
    ) -> Result<BTreeSet<String>, ApplicationError> {
        let approvers: BTreeSet<String> = match template.approver_type {
            ApproverType::User => template
                .approver_emails
                .iter()
                .map(|email| normalize_key(email))
                .filter(|email| !email.is_empty())
                .collect(),
            ApproverType::Role => {
                let mut members = BTreeSet::new();
                for role in &template.approver_roles {
                    let found = self.directory.role_members(tenant_id, role).await?;
                    members.extend(
                        found
                            .iter()
                            .map(|member| normalize_key(member))
                            .filter(|member| !member.is_empty()),
                    );
                }
                members
            }
        };

        if approvers.is_empty() && template.required {
            let reason = match template.approver_type {
                ApproverType::Role => format!(
                    "roles [{}] have no members in tenant `{tenant_id}`",
                    template.approver_roles.iter().cloned().collect::<Vec<_>>().join(", ")
                ),
                ApproverType::User => "no approver emails configured".to_string(),
            };
            return Err(DomainError::Resolution { step_number: template.step_number, reason }.into());
        }

        Ok(approvers)
    }
}
