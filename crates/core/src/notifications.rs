use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::domain::action::ActionKind;
use crate::domain::request::{RequestId, RequestStatus, StepId};

/// Events the engine hands to the (external) notification delivery layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotificationTrigger {
    StepActivated {
        request_id: RequestId,
        step_id: StepId,
        step_number: u32,
        approvers: BTreeSet<String>,
    },
    DecisionRecorded {
        request_id: RequestId,
        step_id: Option<StepId>,
        actor: String,
        action: ActionKind,
    },
    RequestCompleted {
        request_id: RequestId,
        status: RequestStatus,
    },
    ResolutionFailed {
        request_id: RequestId,
        step_id: StepId,
        step_number: u32,
        reason: String,
    },
}

impl NotificationTrigger {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::StepActivated { .. } => "approval.step.activated",
            Self::DecisionRecorded { .. } => "approval.decision.recorded",
            Self::RequestCompleted { .. } => "approval.request.completed",
            Self::ResolutionFailed { .. } => "approval.step.resolution_failed",
        }
    }

    pub fn request_id(&self) -> &RequestId {
        match self {
            Self::StepActivated { request_id, .. }
            | Self::DecisionRecorded { request_id, .. }
            | Self::RequestCompleted { request_id, .. }
            | Self::ResolutionFailed { request_id, .. } => request_id,
        }
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, trigger: NotificationTrigger);
}

/// Emits triggers as structured log events; the default when no delivery layer is wired.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotificationSink;

impl NotificationSink for TracingNotificationSink {
    fn notify(&self, trigger: NotificationTrigger) {
        let payload = serde_json::to_string(&trigger).unwrap_or_default();
        match &trigger {
            NotificationTrigger::ResolutionFailed { reason, .. } => warn!(
                event_name = trigger.event_name(),
                request_id = %trigger.request_id().0,
                reason = %reason,
                payload = %payload,
                "approver resolution failed; step requires administrator attention"
            ),
            _ => info!(
                event_name = trigger.event_name(),
                request_id = %trigger.request_id().0,
                payload = %payload,
                "notification trigger emitted"
            ),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    triggers: Arc<Mutex<Vec<NotificationTrigger>>>,
}

impl InMemoryNotificationSink {
    pub fn triggers(&self) -> Vec<NotificationTrigger> {
        match self.triggers.lock() {
            Ok(triggers) => triggers.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn notify(&self, trigger: NotificationTrigger) {
        match self.triggers.lock() {
            Ok(mut triggers) => triggers.push(trigger),
            Err(poisoned) => poisoned.into_inner().push(trigger),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::domain::request::{RequestId, RequestStatus};
    use crate::notifications::{InMemoryNotificationSink, NotificationSink, NotificationTrigger};

    #[test]
    fn in_memory_sink_records_triggers_in_order() {
        let sink = InMemoryNotificationSink::default();
        sink.notify(NotificationTrigger::RequestCompleted {
            request_id: RequestId("R-2026-0042".to_owned()),
            status: RequestStatus::Approved,
        });

        let triggers = sink.triggers();
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].event_name(), "approval.request.completed");
        assert_eq!(triggers[0].request_id().0, "R-2026-0042");
    }
}
