use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::normalize_key;
use crate::domain::request::{RequestId, StepId};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Approve,
    Reject,
    Comment,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Comment => "comment",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match normalize_key(value).as_str() {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "comment" => Some(Self::Comment),
            _ => None,
        }
    }

    pub fn is_decisive(&self) -> bool {
        matches!(self, Self::Approve | Self::Reject)
    }
}

/// One immutable entry of the decision ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalAction {
    pub id: ActionId,
    pub request_id: RequestId,
    pub step_id: Option<StepId>,
    pub step_order: u32,
    pub approver_email: String,
    pub action: ActionKind,
    /// Set when a decisive attempt arrived too late and was logged as a comment.
    pub intended_action: Option<ActionKind>,
    pub comments: Option<String>,
    pub action_date: DateTime<Utc>,
    pub sequence: u32,
    pub prev_hash: Option<String>,
    pub entry_hash: String,
}
