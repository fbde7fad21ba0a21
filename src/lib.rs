//! Multi-step approval workflow for records that must be signed off before
//! they move on: ordered internal and external sign-offs, requester
//! auto-approval, derived request status, rollback, and write-back of the
//! outcome into arbitrary subject types.

pub mod config;
pub mod error;
pub mod events;
pub mod ledger;
pub mod request;
pub mod service;
pub mod subject;
pub mod template;
pub mod types;
pub mod utils;

pub use config::ServiceConfig;
pub use error::ApprovalError;
pub use events::{ApprovalEvent, CollectingEventSink, EventSink, TracingEventSink};
pub use ledger::{ApprovalStep, StepKind, StepLedger, StepStatus};
pub use request::{ApprovalContext, ApprovalRequest, RequestStatus};
pub use service::ApprovalService;
pub use subject::{
    StatusSyncTarget, StepColumnMap, StepSideEffectHook, Subject, SubjectObserver,
    SubjectRegistry, SyncOutcome,
};
pub use template::{FormType, StepTemplate};
pub use types::{Actor, SubjectRef, TimeStamp};
