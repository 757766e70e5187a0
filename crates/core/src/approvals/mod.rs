//! Approval routing: approver resolution, the request state machine and the
//! service that runs transitions against the stores.

pub mod lifecycle;
pub mod locks;
pub mod resolver;
pub mod service;

pub use lifecycle::{
    check_invariants, is_reserved_identity, Actor, Command, Outcome, Transition, TransitionOutput,
    SYSTEM_ACTOR, TIMEOUT_COMMENT,
};
pub use locks::KeyedLocks;
pub use resolver::{ApproverResolver, DirectoryError, IdentityDirectory, InMemoryIdentityDirectory};
pub use service::{ApprovalService, NewApprovalRequest, RequestQuery, RequestView, TimeoutOutcome};
