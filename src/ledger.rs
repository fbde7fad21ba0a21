//! Step ledger: the ordered sign-offs of one approval request, the per-step
//! transitions, and the rollup that derives the request status from them.
use super::error::ApprovalError;
use super::request::RequestStatus;
use super::template::StepTemplate;
use super::types::{Actor, TimeStamp};
use chrono::Utc;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum StepStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
    #[n(3)]
    Skipped,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Approved => "approved",
            StepStatus::Rejected => "rejected",
            StepStatus::Skipped => "skipped",
        }
    }
    // approved or skipped both count towards a fully approved request
    pub fn is_resolved_ok(&self) -> bool {
        matches!(self, StepStatus::Approved | StepStatus::Skipped)
    }
}

/// Who signs a step: an account in the system, or a named outside party.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    Internal,
    External,
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepKind::Internal => f.write_str("internal"),
            StepKind::External => f.write_str("external"),
        }
    }
}

/// One stored step row.
#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct ApprovalStep {
    #[n(0)]
    pub request_id: String,
    #[n(1)]
    pub step_order: u32, // 1-based, contiguous
    #[n(2)]
    pub code: String,
    #[n(3)]
    pub label: String,
    #[n(4)]
    pub is_external: bool,
    #[n(5)]
    pub auto_approve_by_creator: bool,
    #[n(6)]
    pub actor: Option<Actor>,
    #[n(7)]
    pub external_name: Option<String>,
    #[n(8)]
    pub external_title: Option<String>,
    #[n(9)]
    pub status: StepStatus,
    #[n(10)]
    pub notes: Option<String>,
    #[n(11)]
    pub acted_at: Option<TimeStamp<Utc>>,
}

impl ApprovalStep {
    pub fn kind(&self) -> StepKind {
        if self.is_external {
            StepKind::External
        } else {
            StepKind::Internal
        }
    }

    /// The value a side effect writes into the subject: the internal actor's
    /// display name, or the external signer's name.
    pub fn signer_name(&self) -> Option<&str> {
        if self.is_external {
            self.external_name.as_deref()
        } else {
            self.actor.as_ref().map(|actor| actor.display_name.as_str())
        }
    }

    fn clear(&mut self) {
        self.status = StepStatus::Pending;
        self.actor = None;
        self.external_name = None;
        self.external_title = None;
        self.notes = None;
        self.acted_at = None;
    }
}

/// Derive the request status from its steps.
///
/// Any rejection wins regardless of position; otherwise the request is
/// approved once every step is approved or skipped.
pub fn rollup(steps: &[ApprovalStep]) -> RequestStatus {
    if steps.iter().any(|step| step.status == StepStatus::Rejected) {
        return RequestStatus::Rejected;
    }
    if is_fully_approved(steps) {
        return RequestStatus::Approved;
    }
    RequestStatus::PendingReview
}

pub fn is_fully_approved(steps: &[ApprovalStep]) -> bool {
    steps.iter().all(|step| step.status.is_resolved_ok())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLedger {
    request_id: String,
    steps: Vec<ApprovalStep>,
}

impl StepLedger {
    pub fn new(request_id: String, mut steps: Vec<ApprovalStep>) -> Self {
        steps.sort_by_key(|step| step.step_order);
        Self { request_id, steps }
    }

    /// Instantiate a template. Auto-approve entries are signed by the
    /// requester at `now`, the rest start pending.
    pub fn seed(
        request_id: &str,
        template: &[StepTemplate],
        requester: &Actor,
        now: &TimeStamp<Utc>,
    ) -> Self {
        let steps = template
            .iter()
            .zip(1u32..)
            .map(|(entry, step_order)| {
                let auto = entry.auto_approve_by_creator;
                ApprovalStep {
                    request_id: request_id.to_string(),
                    step_order,
                    code: entry.code.to_string(),
                    label: entry.label.to_string(),
                    is_external: entry.is_external,
                    auto_approve_by_creator: auto,
                    actor: auto.then(|| requester.clone()),
                    external_name: None,
                    external_title: None,
                    status: if auto {
                        StepStatus::Approved
                    } else {
                        StepStatus::Pending
                    },
                    notes: None,
                    acted_at: auto.then(|| now.clone()),
                }
            })
            .collect();

        Self::new(request_id.to_string(), steps)
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn steps(&self) -> &[ApprovalStep] {
        &self.steps
    }

    pub fn into_steps(self) -> Vec<ApprovalStep> {
        self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step(&self, step_order: u32) -> Option<&ApprovalStep> {
        self.steps.iter().find(|step| step.step_order == step_order)
    }

    /// The lowest-ordered pending step, if any.
    pub fn current(&self) -> Option<&ApprovalStep> {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Pending)
            .min_by_key(|step| step.step_order)
    }

    pub fn current_order(&self) -> Option<u32> {
        self.current().map(|step| step.step_order)
    }

    pub fn rollup(&self) -> RequestStatus {
        rollup(&self.steps)
    }

    pub fn is_fully_approved(&self) -> bool {
        is_fully_approved(&self.steps)
    }

    // re-validate that `expected_order` is still the current pending step and
    // that it is of the kind the action needs
    fn current_mut(
        &mut self,
        expected_order: u32,
        expected: StepKind,
    ) -> Result<&mut ApprovalStep, ApprovalError> {
        if self.current_order() != Some(expected_order) {
            return Err(ApprovalError::StaleStep {
                request_id: self.request_id.clone(),
                expected_order,
            });
        }

        let step = self
            .steps
            .iter_mut()
            .find(|step| step.step_order == expected_order)
            .ok_or_else(|| ApprovalError::StaleStep {
                request_id: self.request_id.clone(),
                expected_order,
            })?;

        if step.kind() != expected {
            return Err(ApprovalError::InvalidStepType {
                step_order: expected_order,
                found: step.kind(),
                expected,
            });
        }
        Ok(step)
    }

    pub fn approve(
        &mut self,
        expected_order: u32,
        actor: &Actor,
        notes: Option<String>,
        now: &TimeStamp<Utc>,
    ) -> Result<&ApprovalStep, ApprovalError> {
        let step = self.current_mut(expected_order, StepKind::Internal)?;
        step.status = StepStatus::Approved;
        step.actor = Some(actor.clone());
        step.notes = notes;
        step.acted_at = Some(now.clone());
        Ok(step)
    }

    /// Rejection is accepted on either kind of step; the actor recorded is
    /// the internal user who entered it.
    pub fn reject(
        &mut self,
        expected_order: u32,
        actor: &Actor,
        notes: Option<String>,
        now: &TimeStamp<Utc>,
    ) -> Result<&ApprovalStep, ApprovalError> {
        let kind = self
            .step(expected_order)
            .map(ApprovalStep::kind)
            .unwrap_or(StepKind::Internal);
        let step = self.current_mut(expected_order, kind)?;
        step.status = StepStatus::Rejected;
        step.actor = Some(actor.clone());
        step.notes = notes;
        step.acted_at = Some(now.clone());
        Ok(step)
    }

    pub fn approve_external(
        &mut self,
        expected_order: u32,
        name: String,
        title: Option<String>,
        notes: Option<String>,
        now: &TimeStamp<Utc>,
    ) -> Result<&ApprovalStep, ApprovalError> {
        let step = self.current_mut(expected_order, StepKind::External)?;
        step.status = StepStatus::Approved;
        step.external_name = Some(name);
        step.external_title = title;
        step.notes = notes;
        step.acted_at = Some(now.clone());
        Ok(step)
    }

    /// Return every non-auto step with `step_order >= from` (all when `None`)
    /// to pending. Yields copies of the steps as they were before the reset
    /// that had been approved, so their side effects can be undone.
    pub fn reset(&mut self, from: Option<u32>) -> Vec<ApprovalStep> {
        let from = from.unwrap_or(1);
        let mut undone = Vec::new();

        for step in self
            .steps
            .iter_mut()
            .filter(|step| step.step_order >= from && !step.auto_approve_by_creator)
        {
            if step.status == StepStatus::Approved {
                undone.push(step.clone());
            }
            step.clear();
        }
        undone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{FormType, steps_for};

    fn requester() -> Actor {
        Actor::new("u-1", "Ada Requester")
    }

    fn seeded(form: FormType) -> StepLedger {
        StepLedger::seed("req1test", steps_for(&form), &requester(), &TimeStamp::new())
    }

    #[test]
    fn seeding_transfer_auto_approves_first_step() {
        let ledger = seeded(FormType::Transfer);

        assert_eq!(ledger.len(), 2);
        let first = ledger.step(1).unwrap();
        assert_eq!(first.status, StepStatus::Approved);
        assert_eq!(first.actor.as_ref(), Some(&requester()));
        assert!(first.acted_at.is_some());
        assert_eq!(ledger.current_order(), Some(2));
        assert_eq!(ledger.rollup(), RequestStatus::PendingReview);
    }

    #[test]
    fn approving_wrong_order_is_stale() {
        let mut ledger = seeded(FormType::InventoryScheduling);
        let err = ledger
            .approve(3, &requester(), None, &TimeStamp::new())
            .unwrap_err();
        assert!(matches!(err, ApprovalError::StaleStep { expected_order: 3, .. }));
    }

    #[test]
    fn internal_approval_of_external_step_is_refused() {
        let mut ledger = seeded(FormType::TurnoverDisposal);
        let err = ledger
            .approve(2, &requester(), None, &TimeStamp::new())
            .unwrap_err();
        assert!(matches!(
            err,
            ApprovalError::InvalidStepType {
                step_order: 2,
                found: StepKind::External,
                expected: StepKind::Internal
            }
        ));
        assert_eq!(ledger.step(2).unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn rejection_anywhere_rejects_request() {
        let mut ledger = seeded(FormType::InventoryScheduling);
        let now = TimeStamp::new();
        ledger.approve(2, &requester(), None, &now).unwrap();
        ledger.reject(3, &requester(), Some("no budget".into()), &now).unwrap();

        assert_eq!(ledger.rollup(), RequestStatus::Rejected);
        assert_eq!(ledger.current(), None);
    }

    #[test]
    fn skipped_counts_as_approved() {
        let mut ledger = seeded(FormType::Transfer);
        ledger.steps[1].status = StepStatus::Skipped;

        assert!(ledger.is_fully_approved());
        assert_eq!(ledger.rollup(), RequestStatus::Approved);
    }

    #[test]
    fn reset_keeps_auto_steps_and_reports_undone() {
        let mut ledger = seeded(FormType::TurnoverDisposal);
        let now = TimeStamp::new();
        ledger
            .approve_external(2, "Dr. Outside".into(), Some("Auditor".into()), None, &now)
            .unwrap();
        ledger.approve(3, &requester(), None, &now).unwrap();

        let undone = ledger.reset(None);

        assert_eq!(
            undone.iter().map(|s| s.step_order).collect::<Vec<_>>(),
            vec![2, 3]
        );
        assert_eq!(ledger.step(1).unwrap().status, StepStatus::Approved);
        let external = ledger.step(2).unwrap();
        assert_eq!(external.status, StepStatus::Pending);
        assert_eq!(external.external_name, None);
        assert_eq!(external.external_title, None);
        assert_eq!(ledger.current_order(), Some(2));
    }

    #[test]
    fn partial_reset_only_touches_later_steps() {
        let mut ledger = seeded(FormType::InventoryScheduling);
        let now = TimeStamp::new();
        ledger.approve(2, &requester(), None, &now).unwrap();
        ledger.approve(3, &requester(), None, &now).unwrap();

        let undone = ledger.reset(Some(3));

        assert_eq!(undone.len(), 1);
        assert_eq!(ledger.step(2).unwrap().status, StepStatus::Approved);
        assert_eq!(ledger.current_order(), Some(3));
    }
}
