//! The approval request record and its derived status
use super::ledger::{ApprovalStep, StepLedger};
use super::template::FormType;
use super::types::{Actor, SubjectRef, TimeStamp};
use chrono::Utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum RequestStatus {
    #[n(0)]
    PendingReview,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::PendingReview => "pending_review",
            RequestStatus::Approved => "approved",
            RequestStatus::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RequestStatus::PendingReview)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ApprovalRequest {
    #[n(0)]
    pub id: String, // bech32 encoded uuid7
    #[n(1)]
    pub subject: SubjectRef,
    #[n(2)]
    pub requested_by: Actor,
    #[n(3)]
    pub reviewed_by: Option<Actor>,
    #[n(4)]
    pub form_type: FormType,
    #[n(5)]
    pub form_title: String,
    #[n(6)]
    pub status: RequestStatus, // only written by `apply_rollup` and `mark_reset`
    #[n(7)]
    pub review_notes: Option<String>,
    #[n(8)]
    pub requested_at: TimeStamp<Utc>,
    #[n(9)]
    pub reviewed_at: Option<TimeStamp<Utc>>,
    #[n(10)]
    pub step_count: u32,
}

impl ApprovalRequest {
    pub fn new(
        id: String,
        subject: SubjectRef,
        requested_by: Actor,
        form_type: FormType,
        form_title: String,
        requested_at: TimeStamp<Utc>,
    ) -> Self {
        Self {
            id,
            subject,
            requested_by,
            reviewed_by: None,
            form_type,
            form_title,
            status: RequestStatus::PendingReview,
            review_notes: None,
            requested_at,
            reviewed_at: None,
            step_count: 0,
        }
    }

    /// Recompute the status from `ledger`. When the request lands in a
    /// terminal state the review fields are filled in if still unset.
    ///
    /// Returns the new status when it changed.
    pub fn apply_rollup(
        &mut self,
        ledger: &StepLedger,
        acting: Option<&Actor>,
        notes: Option<&str>,
        now: &TimeStamp<Utc>,
    ) -> Option<RequestStatus> {
        let previous = self.status;
        self.status = ledger.rollup();
        self.step_count = ledger.len() as u32;

        if self.status.is_terminal() {
            if self.reviewed_by.is_none() {
                self.reviewed_by = acting.cloned();
            }
            if self.reviewed_at.is_none() {
                self.reviewed_at = Some(now.clone());
            }
            if self.review_notes.is_none() {
                self.review_notes = notes.map(str::to_string);
            }
        }

        (previous != self.status).then_some(self.status)
    }

    /// Recompute the status after `ledger` was rolled back. The status
    /// returns to pending review unless the remaining steps still decide it
    /// (a rejection before the reset point, or nothing left to reset); the
    /// previous review is only forgotten once the request is open again.
    pub fn mark_reset(&mut self, ledger: &StepLedger) -> RequestStatus {
        self.status = ledger.rollup();
        self.step_count = ledger.len() as u32;
        if !self.status.is_terminal() {
            self.reviewed_by = None;
            self.reviewed_at = None;
            self.review_notes = None;
        }
        self.status
    }
}

/// A request together with its steps, as read in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApprovalContext {
    pub request: ApprovalRequest,
    pub ledger: StepLedger,
}

impl ApprovalContext {
    pub fn status(&self) -> RequestStatus {
        self.request.status
    }

    pub fn current_step(&self) -> Option<&ApprovalStep> {
        self.ledger.current()
    }

    pub fn steps(&self) -> &[ApprovalStep] {
        self.ledger.steps()
    }

    /// The stored status agrees with a fresh rollup of the stored steps.
    pub fn is_consistent(&self) -> bool {
        self.request.status == self.ledger.rollup()
            && self.request.step_count as usize == self.ledger.len()
    }
}
