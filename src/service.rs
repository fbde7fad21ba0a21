//! Service layer API for approval workflow operations
//!
//! Every mutating operation is one sled transaction over the request row,
//! its step rows and the subject row, so a step transition, its side effect,
//! the subject status sync and the rollup either all land or none do.
use super::config::ServiceConfig;
use super::error::ApprovalError;
use super::events::{ApprovalEvent, EventSink, TracingEventSink};
use super::ledger::{ApprovalStep, StepLedger, StepStatus};
use super::request::{ApprovalContext, ApprovalRequest, RequestStatus};
use super::subject::{Subject, SubjectObserver, SubjectRegistry, SyncOutcome};
use super::template::{FormType, steps_for};
use super::types::{Actor, SubjectRef, TimeStamp};
use super::utils::{new_uuid_to_bech32, step_key};
use sled::Transactional;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard};

type TxResult<T> = ConflictableTransactionResult<T, ApprovalError>;

const LOCK_STRIPES: usize = 64;

trait OrAbort<T> {
    fn or_abort(self) -> TxResult<T>;
}

impl<T, E: Into<ApprovalError>> OrAbort<T> for Result<T, E> {
    fn or_abort(self) -> TxResult<T> {
        self.map_err(|e| ConflictableTransactionError::Abort(e.into()))
    }
}

/// Per-request mutual exclusion inside this process. Request ids hash onto a
/// fixed set of stripes; the transaction re-validation covers everything else.
struct RequestLocks {
    stripes: Vec<Mutex<()>>,
}

impl RequestLocks {
    fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe_for(&self, request_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        request_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.stripes.len()
    }

    fn lock(&self, request_id: &str) -> MutexGuard<'_, ()> {
        // the guarded data is (), a panic elsewhere cannot leave it torn
        self.stripes[self.stripe_for(request_id)]
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// The actor operations, applied to the step expected to be current.
enum StepAction<'a> {
    Approve {
        actor: &'a Actor,
        notes: Option<String>,
    },
    Reject {
        actor: &'a Actor,
        notes: Option<String>,
    },
    ExternalApprove {
        name: String,
        title: Option<String>,
        notes: Option<String>,
    },
}

impl StepAction<'_> {
    fn name(&self) -> &'static str {
        match self {
            StepAction::Approve { .. } => "approve",
            StepAction::Reject { .. } => "reject",
            StepAction::ExternalApprove { .. } => "external_approve",
        }
    }

    fn actor(&self) -> Option<&Actor> {
        match self {
            StepAction::Approve { actor, .. } | StepAction::Reject { actor, .. } => Some(*actor),
            StepAction::ExternalApprove { .. } => None,
        }
    }

    fn notes(&self) -> Option<&str> {
        match self {
            StepAction::Approve { notes, .. }
            | StepAction::Reject { notes, .. }
            | StepAction::ExternalApprove { notes, .. } => notes.as_deref(),
        }
    }
}

// the transactional trees of one unit of work
struct TxView<'a> {
    requests: &'a TransactionalTree,
    steps: &'a TransactionalTree,
    subjects: &'a TransactionalTree,
    subject_index: &'a TransactionalTree,
}

impl TxView<'_> {
    fn load_request(&self, request_id: &str) -> TxResult<ApprovalRequest> {
        let Some(bytes) = self.requests.get(request_id.as_bytes())? else {
            return Err(ConflictableTransactionError::Abort(
                ApprovalError::RequestNotFound(request_id.to_string()),
            ));
        };
        minicbor::decode::<ApprovalRequest>(&bytes).or_abort()
    }

    fn load_ledger(&self, request: &ApprovalRequest) -> TxResult<StepLedger> {
        let mut steps = Vec::with_capacity(request.step_count as usize);
        for step_order in 1..=request.step_count {
            let Some(bytes) = self.steps.get(step_key(&request.id, step_order))? else {
                return Err(ConflictableTransactionError::Abort(
                    ApprovalError::RequestNotFound(request.id.clone()),
                ));
            };
            let step = minicbor::decode::<ApprovalStep>(&bytes).or_abort()?;
            steps.push(step);
        }
        Ok(StepLedger::new(request.id.clone(), steps))
    }

    fn load_context(&self, request_id: &str) -> TxResult<ApprovalContext> {
        let request = self.load_request(request_id)?;
        let ledger = self.load_ledger(&request)?;
        Ok(ApprovalContext { request, ledger })
    }

    fn store_request(&self, request: &ApprovalRequest) -> TxResult<()> {
        let bytes = minicbor::to_vec(request).or_abort()?;
        self.requests.insert(request.id.as_bytes(), bytes)?;
        Ok(())
    }

    fn store_step(&self, step: &ApprovalStep) -> TxResult<()> {
        let bytes = minicbor::to_vec(step).or_abort()?;
        self.steps
            .insert(step_key(&step.request_id, step.step_order), bytes)?;
        Ok(())
    }

    fn subject_bytes(&self, subject: &SubjectRef) -> TxResult<sled::IVec> {
        match self.subjects.get(subject.storage_key())? {
            Some(bytes) => Ok(bytes),
            None => Err(ConflictableTransactionError::Abort(
                ApprovalError::SubjectNotFound(subject.clone()),
            )),
        }
    }

    // silent write: straight into the subjects tree, observers are not told
    fn rewrite_subject(&self, subject: &SubjectRef, updated: Option<Vec<u8>>) -> TxResult<()> {
        if let Some(bytes) = updated {
            self.subjects.insert(subject.storage_key(), bytes)?;
        }
        Ok(())
    }

    fn apply_step_side_effects(
        &self,
        registry: &SubjectRegistry,
        request: &ApprovalRequest,
        step: &ApprovalStep,
    ) -> TxResult<()> {
        let handler = registry.handler(&request.subject.subject_type).or_abort()?;
        let bytes = self.subject_bytes(&request.subject)?;
        let updated = handler.apply_step(&bytes, step, request).or_abort()?;
        self.rewrite_subject(&request.subject, updated)
    }

    fn undo_step_side_effects(
        &self,
        registry: &SubjectRegistry,
        subject: &SubjectRef,
        undone: &[ApprovalStep],
    ) -> TxResult<()> {
        let handler = registry.handler(&subject.subject_type).or_abort()?;
        let bytes = self.subject_bytes(subject)?;
        let updated = handler.undo_steps(&bytes, undone).or_abort()?;
        self.rewrite_subject(subject, updated)
    }

    fn sync_status(
        &self,
        registry: &SubjectRegistry,
        subject: &SubjectRef,
        outcome: SyncOutcome,
    ) -> TxResult<()> {
        let handler = registry.handler(&subject.subject_type).or_abort()?;
        let bytes = self.subject_bytes(subject)?;
        let updated = handler.sync_status(&bytes, outcome).or_abort()?;
        self.rewrite_subject(subject, updated)
    }
}

pub struct ApprovalService {
    instance: Arc<sled::Db>,
    requests: sled::Tree,
    steps: sled::Tree,
    subjects: sled::Tree,
    subject_index: sled::Tree,
    registry: SubjectRegistry,
    events: Arc<dyn EventSink>,
    observers: Vec<Arc<dyn SubjectObserver>>,
    locks: RequestLocks,
    config: ServiceConfig,
}

impl ApprovalService {
    pub fn new(instance: Arc<sled::Db>, registry: SubjectRegistry) -> Result<Self, ApprovalError> {
        Self::with_config(instance, registry, ServiceConfig::default())
    }

    pub fn with_config(
        instance: Arc<sled::Db>,
        registry: SubjectRegistry,
        config: ServiceConfig,
    ) -> Result<Self, ApprovalError> {
        Ok(Self {
            requests: instance.open_tree(&config.requests_tree)?,
            steps: instance.open_tree(&config.steps_tree)?,
            subjects: instance.open_tree(&config.subjects_tree)?,
            subject_index: instance.open_tree(&config.subject_index_tree)?,
            instance,
            registry,
            events: Arc::new(TracingEventSink),
            observers: Vec::new(),
            locks: RequestLocks::new(LOCK_STRIPES),
            config,
        })
    }

    /// Replace the default logging sink.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Hook into the subjects' own change notification.
    pub fn with_observer(mut self, observer: Arc<dyn SubjectObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    fn transact<A>(&self, f: impl Fn(&TxView<'_>) -> TxResult<A>) -> Result<A, ApprovalError> {
        let result = (
            &self.requests,
            &self.steps,
            &self.subjects,
            &self.subject_index,
        )
            .transaction(|(requests, steps, subjects, subject_index)| {
                f(&TxView {
                    requests,
                    steps,
                    subjects,
                    subject_index,
                })
            });

        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(err)) => Err(err),
            Err(TransactionError::Storage(err)) => Err(ApprovalError::Storage(err)),
        }
    }

    // hold the request's lock for the whole unit of work
    fn commit<A>(
        &self,
        request_id: &str,
        f: impl Fn(&TxView<'_>) -> TxResult<A>,
    ) -> Result<A, ApprovalError> {
        let _guard = self.locks.lock(request_id);
        let value = self.transact(f)?;
        if self.config.flush_on_commit {
            self.instance.flush()?;
        }
        Ok(value)
    }

    /// Store `subject` and open its approval request in one transaction.
    ///
    /// Steps are seeded from the form type's template, auto-approve steps are
    /// signed by `requested_by`.
    pub fn open_request<S: Subject>(
        &self,
        subject_id: &str,
        subject: &S,
        requested_by: &Actor,
        form_type: FormType,
        form_title: &str,
    ) -> Result<ApprovalContext, ApprovalError> {
        let handler = self.registry.handler(S::SUBJECT_TYPE)?;
        let subject_ref = SubjectRef::new(S::SUBJECT_TYPE, subject_id);
        let subject_bytes = minicbor::to_vec(subject)?;
        let request_id =
            new_uuid_to_bech32(&self.config.request_id_hrp).map_err(ApprovalError::Identifier)?;

        let context = self.commit(&request_id, |tx| {
            let subject_key = subject_ref.storage_key();
            if tx.subject_index.get(&subject_key)?.is_some() {
                return Err(ConflictableTransactionError::Abort(
                    ApprovalError::DuplicateRequest(subject_ref.clone()),
                ));
            }

            let now = TimeStamp::new();
            let ledger = StepLedger::seed(&request_id, steps_for(&form_type), requested_by, &now);
            let mut request = ApprovalRequest::new(
                request_id.clone(),
                subject_ref.clone(),
                requested_by.clone(),
                form_type.clone(),
                form_title.to_string(),
                now.clone(),
            );
            request.apply_rollup(&ledger, Some(requested_by), None, &now);

            // a template of auto steps only is decided at creation
            let mut bytes = subject_bytes.clone();
            if request.status == RequestStatus::Approved {
                if let Some(synced) = handler
                    .sync_status(&bytes, SyncOutcome::Approved)
                    .or_abort()?
                {
                    bytes = synced;
                }
            }

            tx.subjects.insert(subject_key.clone(), bytes)?;
            tx.subject_index
                .insert(subject_key, request.id.as_bytes())?;
            tx.store_request(&request)?;
            for step in ledger.steps() {
                tx.store_step(step)?;
            }
            Ok(ApprovalContext { request, ledger })
        })?;

        tracing::debug!(
            request_id = %context.request.id,
            subject = %subject_ref,
            form_type = %context.request.form_type,
            steps = context.ledger.len(),
            status = context.request.status.as_str(),
            "approval request opened"
        );

        self.notify_observers(&subject_ref);
        if context.request.status == RequestStatus::Approved {
            self.events.publish(&ApprovalEvent::RequestApproved {
                request_id: context.request.id.clone(),
                subject: subject_ref.clone(),
            });
        }
        self.publish_awaiting(&context, None);
        Ok(context)
    }

    /// Load the request and its steps.
    pub fn request(&self, request_id: &str) -> Result<ApprovalContext, ApprovalError> {
        self.transact(|tx| tx.load_context(request_id))
    }

    pub fn request_for_subject(
        &self,
        subject: &SubjectRef,
    ) -> Result<Option<ApprovalContext>, ApprovalError> {
        let Some(request_id) = self.subject_index.get(subject.storage_key())? else {
            return Ok(None);
        };
        let request_id = String::from_utf8_lossy(&request_id).into_owned();
        self.request(&request_id).map(Some)
    }

    pub fn current_step(&self, request_id: &str) -> Result<Option<ApprovalStep>, ApprovalError> {
        Ok(self.request(request_id)?.current_step().cloned())
    }

    pub fn load_subject<S: Subject>(&self, subject_id: &str) -> Result<Option<S>, ApprovalError> {
        let key = SubjectRef::new(S::SUBJECT_TYPE, subject_id).storage_key();
        match self.subjects.get(key)? {
            Some(bytes) => Ok(Some(minicbor::decode::<S>(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The subject's normal write path. Unlike engine sync writes, this
    /// notifies every registered [`SubjectObserver`].
    ///
    /// Runs under the lock of the subject's request. Signer columns of a
    /// column-mapped subject are taken from the stored steps, not from
    /// `subject`, so saving a copy read before a transition cannot undo it.
    pub fn save_subject<S: Subject>(&self, subject_id: &str, subject: &S) -> Result<(), ApprovalError> {
        let handler = self.registry.handler(S::SUBJECT_TYPE)?;
        let subject_ref = SubjectRef::new(S::SUBJECT_TYPE, subject_id);
        let subject_key = subject_ref.storage_key();
        let subject_bytes = minicbor::to_vec(subject)?;

        let lock_key = match self.subject_index.get(&subject_key)? {
            Some(request_id) => String::from_utf8_lossy(&request_id).into_owned(),
            None => subject_ref.to_string(),
        };

        self.commit(&lock_key, |tx| {
            let mut bytes = subject_bytes.clone();
            if let Some(request_id) = tx.subject_index.get(&subject_key)? {
                let context = tx.load_context(&String::from_utf8_lossy(&request_id))?;
                if let Some(restored) = handler
                    .restore_columns(&bytes, context.steps())
                    .or_abort()?
                {
                    bytes = restored;
                }
            }
            tx.subjects.insert(subject_key.clone(), bytes)?;
            Ok(())
        })?;

        tracing::debug!(subject = %subject_ref, "subject saved");
        self.notify_observers(&subject_ref);
        Ok(())
    }

    /// Approve the current step as `actor`. No-op when every step is resolved.
    pub fn approve_current_step(
        &self,
        request_id: &str,
        actor: &Actor,
        notes: Option<String>,
    ) -> Result<ApprovalContext, ApprovalError> {
        self.act_on_current(request_id, StepAction::Approve { actor, notes })
    }

    /// Reject the current step as `actor`. No-op when every step is resolved.
    pub fn reject_current_step(
        &self,
        request_id: &str,
        actor: &Actor,
        notes: Option<String>,
    ) -> Result<ApprovalContext, ApprovalError> {
        self.act_on_current(request_id, StepAction::Reject { actor, notes })
    }

    /// Record the signature of an outside party on the current step, which
    /// must be external.
    pub fn external_approve_current_step(
        &self,
        request_id: &str,
        name: &str,
        title: Option<&str>,
        notes: Option<String>,
    ) -> Result<ApprovalContext, ApprovalError> {
        self.act_on_current(
            request_id,
            StepAction::ExternalApprove {
                name: name.to_string(),
                title: title.map(str::to_string),
                notes,
            },
        )
    }

    /// Approve step `expected_order`, failing with `StaleStep` if it is no
    /// longer the current pending step.
    pub fn approve_step(
        &self,
        request_id: &str,
        expected_order: u32,
        actor: &Actor,
        notes: Option<String>,
    ) -> Result<ApprovalContext, ApprovalError> {
        self.act(request_id, expected_order, StepAction::Approve { actor, notes })
    }

    pub fn reject_step(
        &self,
        request_id: &str,
        expected_order: u32,
        actor: &Actor,
        notes: Option<String>,
    ) -> Result<ApprovalContext, ApprovalError> {
        self.act(request_id, expected_order, StepAction::Reject { actor, notes })
    }

    pub fn external_approve_step(
        &self,
        request_id: &str,
        expected_order: u32,
        name: &str,
        title: Option<&str>,
        notes: Option<String>,
    ) -> Result<ApprovalContext, ApprovalError> {
        self.act(
            request_id,
            expected_order,
            StepAction::ExternalApprove {
                name: name.to_string(),
                title: title.map(str::to_string),
                notes,
            },
        )
    }

    // read the current step outside the lock, then act on it under the lock;
    // a concurrent writer in between turns into `StaleStep`
    fn act_on_current(
        &self,
        request_id: &str,
        action: StepAction<'_>,
    ) -> Result<ApprovalContext, ApprovalError> {
        let context = self.request(request_id)?;
        let Some(expected_order) = context.ledger.current_order() else {
            tracing::debug!(request_id, action = action.name(), "no current step, nothing to do");
            return Ok(context);
        };
        self.act(request_id, expected_order, action)
    }

    fn act(
        &self,
        request_id: &str,
        expected_order: u32,
        action: StepAction<'_>,
    ) -> Result<ApprovalContext, ApprovalError> {
        let result = self.commit(request_id, |tx| {
            let ApprovalContext {
                mut request,
                mut ledger,
            } = tx.load_context(request_id)?;
            let previous = ledger.current_order();
            let now = TimeStamp::new();

            let step = match &action {
                StepAction::Approve { actor, notes } => {
                    ledger.approve(expected_order, actor, notes.clone(), &now)
                }
                StepAction::Reject { actor, notes } => {
                    ledger.reject(expected_order, actor, notes.clone(), &now)
                }
                StepAction::ExternalApprove { name, title, notes } => ledger.approve_external(
                    expected_order,
                    name.clone(),
                    title.clone(),
                    notes.clone(),
                    &now,
                ),
            }
            .or_abort()?
            .clone();

            if step.status == StepStatus::Approved {
                tx.apply_step_side_effects(&self.registry, &request, &step)?;
            }

            let transition = request.apply_rollup(&ledger, action.actor(), action.notes(), &now);
            match transition {
                Some(RequestStatus::Approved) => {
                    tx.sync_status(&self.registry, &request.subject, SyncOutcome::Approved)?
                }
                Some(RequestStatus::Rejected) => {
                    tx.sync_status(&self.registry, &request.subject, SyncOutcome::Rejected)?
                }
                _ => {}
            }

            tx.store_request(&request)?;
            tx.store_step(&step)?;
            Ok((ApprovalContext { request, ledger }, previous, transition))
        });

        let (context, previous, transition) = match result {
            Ok(done) => done,
            Err(err) => {
                if err.is_retryable() {
                    tracing::warn!(request_id, expected_order, action = action.name(), "{err}");
                }
                return Err(err);
            }
        };

        tracing::debug!(
            request_id,
            step_order = expected_order,
            action = action.name(),
            status = context.request.status.as_str(),
            "approval step transitioned"
        );

        match transition {
            Some(RequestStatus::Approved) => self.events.publish(&ApprovalEvent::RequestApproved {
                request_id: context.request.id.clone(),
                subject: context.request.subject.clone(),
            }),
            Some(RequestStatus::Rejected) => self.events.publish(&ApprovalEvent::RequestRejected {
                request_id: context.request.id.clone(),
                subject: context.request.subject.clone(),
                step_order: expected_order,
            }),
            _ => {}
        }
        self.publish_awaiting(&context, previous);
        Ok(context)
    }

    /// Roll steps from `from_step_order` on (all steps when `None`) back to
    /// pending, undoing the subject fields their approvals wrote. Steps
    /// auto-approved by the creator are kept.
    pub fn reset_to_pending(
        &self,
        request_id: &str,
        from_step_order: Option<u32>,
    ) -> Result<ApprovalContext, ApprovalError> {
        let context = self.commit(request_id, |tx| {
            let ApprovalContext {
                mut request,
                mut ledger,
            } = tx.load_context(request_id)?;

            let undone = ledger.reset(from_step_order);
            if !undone.is_empty() {
                tx.undo_step_side_effects(&self.registry, &request.subject, &undone)?;
            }

            // the subject follows whatever the remaining steps decide
            let outcome = match request.mark_reset(&ledger) {
                RequestStatus::PendingReview => SyncOutcome::Reset,
                RequestStatus::Rejected => SyncOutcome::Rejected,
                RequestStatus::Approved => SyncOutcome::Approved,
            };
            tx.sync_status(&self.registry, &request.subject, outcome)?;

            tx.store_request(&request)?;
            for step in ledger.steps() {
                tx.store_step(step)?;
            }
            Ok(ApprovalContext { request, ledger })
        })?;

        tracing::debug!(
            request_id,
            from_step_order = ?from_step_order,
            status = context.request.status.as_str(),
            "approval request reset"
        );

        self.events.publish(&ApprovalEvent::RequestReset {
            request_id: context.request.id.clone(),
            subject: context.request.subject.clone(),
            from_step_order,
        });
        self.publish_awaiting(&context, None);
        Ok(context)
    }

    fn publish_awaiting(&self, context: &ApprovalContext, previous: Option<u32>) {
        if context.request.status != RequestStatus::PendingReview {
            return;
        }
        let Some(step) = context.current_step() else {
            return;
        };
        if previous == Some(step.step_order) {
            return;
        }
        self.events.publish(&ApprovalEvent::StepAwaitingAction {
            request_id: context.request.id.clone(),
            subject: context.request.subject.clone(),
            step_order: step.step_order,
            code: step.code.clone(),
            label: step.label.clone(),
            is_external: step.is_external,
        });
    }

    fn notify_observers(&self, subject: &SubjectRef) {
        for observer in &self.observers {
            observer.subject_saved(subject);
        }
    }
}
