//! Events the engine exposes to outside collaborators (notifications, audit).
//! Delivery is the sink's business; events are only emitted after commit.
use super::types::SubjectRef;
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalEvent {
    /// A step became the current step and waits for its signer.
    StepAwaitingAction {
        request_id: String,
        subject: SubjectRef,
        step_order: u32,
        code: String,
        label: String,
        is_external: bool,
    },
    RequestApproved {
        request_id: String,
        subject: SubjectRef,
    },
    RequestRejected {
        request_id: String,
        subject: SubjectRef,
        step_order: u32,
    },
    RequestReset {
        request_id: String,
        subject: SubjectRef,
        from_step_order: Option<u32>,
    },
}

impl ApprovalEvent {
    pub fn request_id(&self) -> &str {
        match self {
            ApprovalEvent::StepAwaitingAction { request_id, .. }
            | ApprovalEvent::RequestApproved { request_id, .. }
            | ApprovalEvent::RequestRejected { request_id, .. }
            | ApprovalEvent::RequestReset { request_id, .. } => request_id,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: &ApprovalEvent);
}

/// Default sink: one structured log line per event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: &ApprovalEvent) {
        match event {
            ApprovalEvent::StepAwaitingAction {
                request_id,
                subject,
                step_order,
                code,
                is_external,
                ..
            } => tracing::info!(
                request_id = %request_id,
                subject = %subject,
                step_order,
                code = %code,
                is_external,
                "approval step awaiting action"
            ),
            ApprovalEvent::RequestApproved { request_id, subject } => {
                tracing::info!(request_id = %request_id, subject = %subject, "approval request approved")
            }
            ApprovalEvent::RequestRejected {
                request_id,
                subject,
                step_order,
            } => tracing::info!(
                request_id = %request_id,
                subject = %subject,
                step_order,
                "approval request rejected"
            ),
            ApprovalEvent::RequestReset {
                request_id,
                subject,
                from_step_order,
            } => tracing::info!(
                request_id = %request_id,
                subject = %subject,
                from_step_order = ?from_step_order,
                "approval request reset to pending"
            ),
        }
    }
}

/// Keeps every event in memory. Handy for tests and for batching delivery.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<ApprovalEvent>>,
}

impl CollectingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return everything collected so far.
    pub fn drain(&self) -> Vec<ApprovalEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl EventSink for CollectingEventSink {
    fn publish(&self, event: &ApprovalEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event.clone());
    }
}
