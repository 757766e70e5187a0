use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::domain::action::{ActionId, ActionKind, ApprovalAction};
use crate::domain::request::{RequestId, StepId};

/// An action produced by a transition, not yet chained into the ledger.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionDraft {
    pub request_id: RequestId,
    pub step_id: Option<StepId>,
    pub step_order: u32,
    pub approver_email: String,
    pub action: ActionKind,
    pub intended_action: Option<ActionKind>,
    pub comments: Option<String>,
    pub action_date: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTail {
    pub sequence: u32,
    pub entry_hash: String,
}

impl LedgerTail {
    pub fn of(actions: &[ApprovalAction]) -> Option<Self> {
        actions
            .iter()
            .max_by_key(|action| action.sequence)
            .map(|action| Self { sequence: action.sequence, entry_hash: action.entry_hash.clone() })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub request_id: RequestId,
    pub valid: bool,
    pub verified_entries: usize,
    pub latest_hash: Option<String>,
    pub failure_reason: Option<String>,
}

/// Chains drafts onto the ledger tail, assigning sequence numbers and hashes.
/// Action dates are cut to milliseconds, the precision the store keeps.
pub fn seal(drafts: Vec<ActionDraft>, tail: Option<LedgerTail>) -> Vec<ApprovalAction> {
    let mut sequence = tail.as_ref().map(|tail| tail.sequence).unwrap_or(0);
    let mut prev_hash = tail.map(|tail| tail.entry_hash);
    let mut sealed = Vec::with_capacity(drafts.len());

    for draft in drafts {
        sequence = sequence.saturating_add(1);
        let mut action = ApprovalAction {
            id: ActionId(Uuid::new_v4().to_string()),
            request_id: draft.request_id,
            step_id: draft.step_id,
            step_order: draft.step_order,
            approver_email: draft.approver_email,
            action: draft.action,
            intended_action: draft.intended_action,
            comments: draft.comments,
            action_date: draft.action_date.trunc_subsecs(3),
            sequence,
            prev_hash: prev_hash.clone(),
            entry_hash: String::new(),
        };
        action.entry_hash = hash_entry_material(&action);
        prev_hash = Some(action.entry_hash.clone());
        sealed.push(action);
    }

    sealed
}

pub fn verify_chain(request_id: &RequestId, actions: &[ApprovalAction]) -> VerificationResult {
    if actions.is_empty() {
        return VerificationResult {
            request_id: request_id.clone(),
            valid: false,
            verified_entries: 0,
            latest_hash: None,
            failure_reason: Some("no ledger entries found for request".to_string()),
        };
    }

    let mut ordered: Vec<&ApprovalAction> = actions.iter().collect();
    ordered.sort_by_key(|action| action.sequence);

    let mut previous_hash: Option<String> = None;
    for (index, entry) in ordered.iter().enumerate() {
        let failure = |reason: String| VerificationResult {
            request_id: request_id.clone(),
            valid: false,
            verified_entries: index,
            latest_hash: previous_hash.clone(),
            failure_reason: Some(reason),
        };

        if &entry.request_id != request_id {
            return failure(format!("entry {} belongs to another request", entry.id.0));
        }

        let expected_sequence = u32::try_from(index).unwrap_or(u32::MAX).saturating_add(1);
        if entry.sequence != expected_sequence {
            return failure(format!(
                "sequence mismatch at entry {}: expected {}, found {}",
                entry.id.0, expected_sequence, entry.sequence
            ));
        }

        if entry.prev_hash != previous_hash {
            return failure(format!("previous hash mismatch at entry {}", entry.id.0));
        }

        if hash_entry_material(entry) != entry.entry_hash {
            return failure(format!("entry hash mismatch at entry {}", entry.id.0));
        }

        previous_hash = Some(entry.entry_hash.clone());
    }

    VerificationResult {
        request_id: request_id.clone(),
        valid: true,
        verified_entries: ordered.len(),
        latest_hash: previous_hash,
        failure_reason: None,
    }
}

fn hash_entry_material(action: &ApprovalAction) -> String {
    // A JSON array keeps field boundaries unambiguous whatever the comments contain.
    let material = serde_json::json!([
        action.request_id.0,
        action.sequence,
        action.step_id.as_ref().map(|id| id.0.as_str()),
        action.step_order,
        action.approver_email,
        action.action.as_str(),
        action.intended_action.map(|kind| kind.as_str()),
        action.comments,
        action.action_date.timestamp_millis(),
        action.prev_hash,
    ]);
    sha256_hex(material.to_string().as_bytes())
}

fn sha256_hex(payload: &[u8]) -> String {
    let digest = Sha256::digest(payload);
    encode_hex(digest.as_slice())
}

fn encode_hex(bytes: &[u8]) -> String {
    let mut output = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}
