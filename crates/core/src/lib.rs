pub mod approvals;
pub mod clock;
pub mod config;
pub mod domain;
pub mod errors;
pub mod ledger;
pub mod notifications;
pub mod scheduler;
pub mod store;
pub mod workflows;

pub use approvals::{
    Actor, ApprovalService, ApproverResolver, DirectoryError, IdentityDirectory,
    InMemoryIdentityDirectory, NewApprovalRequest, RequestQuery, RequestView, TimeoutOutcome,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::action::{ActionKind, ApprovalAction};
pub use domain::request::{
    ApprovalRequest, ApprovalStep, Decision, RequestId, RequestStatus, StepId, StepStatus,
};
pub use domain::workflow::{ApproverType, StepTemplate, WorkflowDefinition, WorkflowId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use ledger::VerificationResult;
pub use notifications::{
    InMemoryNotificationSink, NotificationSink, NotificationTrigger, TracingNotificationSink,
};
pub use scheduler::{SchedulerSettings, SweepReport, SweepStatus, TimeoutScheduler};
pub use store::{
    ApprovalStore, ApprovalTimer, InMemoryApprovalStore, RequestFilter, RequestWrite, StoreError,
    TimerOp, TimerStore, TransitionCommit, WorkflowStore,
};
pub use workflows::{WorkflowCatalog, WorkflowDraft};
