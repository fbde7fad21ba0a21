//! Subject contract and the two dispatchers that write approval outcomes
//! back into subjects: step side effects and status sync.
//!
//! The engine never knows a subject's schema. A subject type implements
//! [`Subject`] and opts into capabilities by returning trait objects from it;
//! the [`SubjectRegistry`] maps the stored `subject_type` tag back to the
//! concrete type at runtime.
use super::error::ApprovalError;
use super::ledger::{ApprovalStep, StepStatus};
use super::request::ApprovalRequest;
use super::types::SubjectRef;
use std::collections::HashMap;

/// What happened to the request, in engine vocabulary. Each subject
/// translates it into its own status field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Reset,
    Rejected,
    Approved,
}

pub trait Subject:
    minicbor::Encode<()> + for<'b> minicbor::Decode<'b, ()> + Send + Sync + 'static
{
    /// Tag stored in `SubjectRef::subject_type`.
    const SUBJECT_TYPE: &'static str;

    /// Full control over what a step approval writes. Checked first.
    fn side_effect_hook(&mut self) -> Option<&mut dyn StepSideEffectHook> {
        None
    }

    /// Declarative step code to field mapping. Used when there is no hook,
    /// and by resets to clear fields again.
    fn step_columns(&mut self) -> Option<&mut dyn StepColumnMap> {
        None
    }
}

pub trait StepSideEffectHook {
    fn apply_approval_step_side_effects(
        &mut self,
        step: &ApprovalStep,
        request: &ApprovalRequest,
    ) -> anyhow::Result<()>;
}

pub trait StepColumnMap {
    /// `(step code, field name)` pairs.
    fn step_code_to_column(&self) -> &[(&'static str, &'static str)];

    /// Silent write of one field. Must not go through the subject's own
    /// change notification; `None` clears the field.
    fn sync_field(&mut self, column: &str, value: Option<&str>) -> anyhow::Result<()>;

    fn column_for(&self, code: &str) -> Option<&'static str> {
        self.step_code_to_column()
            .iter()
            .find(|(step_code, _)| *step_code == code)
            .map(|(_, column)| *column)
    }
}

pub trait StatusSyncTarget {
    fn sync_approval_status(&mut self, outcome: SyncOutcome);
}

/// The subject's own change-notification pipeline. Called when a subject is
/// saved through the normal path, never for engine sync writes.
pub trait SubjectObserver: Send + Sync {
    fn subject_saved(&self, subject: &SubjectRef);
}

/// Write the signer of a freshly approved step into `subject`.
///
/// Returns whether the subject may have changed.
pub fn apply_step_side_effects<S: Subject>(
    subject: &mut S,
    step: &ApprovalStep,
    request: &ApprovalRequest,
) -> Result<bool, ApprovalError> {
    if let Some(hook) = subject.side_effect_hook() {
        hook.apply_approval_step_side_effects(step, request)
            .map_err(ApprovalError::SideEffect)?;
        return Ok(true);
    }

    let Some(columns) = subject.step_columns() else {
        return Ok(false);
    };
    let (Some(column), Some(value)) = (columns.column_for(&step.code), step.signer_name()) else {
        return Ok(false);
    };

    tracing::debug!(code = %step.code, column, "writing step signer into subject");
    columns
        .sync_field(column, Some(value))
        .map_err(ApprovalError::SideEffect)?;
    Ok(true)
}

/// Clear the fields previously written for `undone` steps.
pub fn undo_step_side_effects<S: Subject>(
    subject: &mut S,
    undone: &[ApprovalStep],
) -> Result<bool, ApprovalError> {
    let Some(columns) = subject.step_columns() else {
        return Ok(false);
    };

    let mut changed = false;
    for step in undone {
        if let Some(column) = columns.column_for(&step.code) {
            tracing::debug!(code = %step.code, column, "clearing step signer from subject");
            columns
                .sync_field(column, None)
                .map_err(ApprovalError::SideEffect)?;
            changed = true;
        }
    }
    Ok(changed)
}

/// Put the engine's signer columns back onto `subject`: the signer of every
/// approved step, nothing for pending ones. Steps signed at creation and
/// rejected steps were never written by the engine and stay as given. A
/// subject with a hook owns its writes and is left alone.
pub fn restore_step_columns<S: Subject>(
    subject: &mut S,
    steps: &[ApprovalStep],
) -> Result<bool, ApprovalError> {
    if subject.side_effect_hook().is_some() {
        return Ok(false);
    }
    let Some(columns) = subject.step_columns() else {
        return Ok(false);
    };

    let mut changed = false;
    for step in steps.iter().filter(|step| !step.auto_approve_by_creator) {
        let Some(column) = columns.column_for(&step.code) else {
            continue;
        };
        let value = match step.status {
            StepStatus::Approved => step.signer_name(),
            StepStatus::Pending => None,
            StepStatus::Rejected | StepStatus::Skipped => continue,
        };
        columns
            .sync_field(column, value)
            .map_err(ApprovalError::SideEffect)?;
        changed = true;
    }
    Ok(changed)
}

// type-erased view of one registered subject type, working on stored bytes
pub(crate) trait SubjectHandler: Send + Sync {
    fn apply_step(
        &self,
        bytes: &[u8],
        step: &ApprovalStep,
        request: &ApprovalRequest,
    ) -> Result<Option<Vec<u8>>, ApprovalError>;

    fn undo_steps(
        &self,
        bytes: &[u8],
        undone: &[ApprovalStep],
    ) -> Result<Option<Vec<u8>>, ApprovalError>;

    fn sync_status(
        &self,
        bytes: &[u8],
        outcome: SyncOutcome,
    ) -> Result<Option<Vec<u8>>, ApprovalError>;

    fn restore_columns(
        &self,
        bytes: &[u8],
        steps: &[ApprovalStep],
    ) -> Result<Option<Vec<u8>>, ApprovalError>;
}

struct TypedHandler<S> {
    translator: Option<fn(&mut S, SyncOutcome)>,
}

impl<S: Subject> TypedHandler<S> {
    fn rewrite(
        &self,
        bytes: &[u8],
        f: impl FnOnce(&mut S) -> Result<bool, ApprovalError>,
    ) -> Result<Option<Vec<u8>>, ApprovalError> {
        let mut subject: S = minicbor::decode(bytes)?;
        if !f(&mut subject)? {
            return Ok(None);
        }
        Ok(Some(minicbor::to_vec(&subject)?))
    }
}

impl<S: Subject> SubjectHandler for TypedHandler<S> {
    fn apply_step(
        &self,
        bytes: &[u8],
        step: &ApprovalStep,
        request: &ApprovalRequest,
    ) -> Result<Option<Vec<u8>>, ApprovalError> {
        self.rewrite(bytes, |subject| apply_step_side_effects(subject, step, request))
    }

    fn undo_steps(
        &self,
        bytes: &[u8],
        undone: &[ApprovalStep],
    ) -> Result<Option<Vec<u8>>, ApprovalError> {
        self.rewrite(bytes, |subject| undo_step_side_effects(subject, undone))
    }

    fn sync_status(
        &self,
        bytes: &[u8],
        outcome: SyncOutcome,
    ) -> Result<Option<Vec<u8>>, ApprovalError> {
        let Some(translate) = self.translator else {
            return Ok(None);
        };
        self.rewrite(bytes, |subject| {
            translate(subject, outcome);
            Ok(true)
        })
    }

    fn restore_columns(
        &self,
        bytes: &[u8],
        steps: &[ApprovalStep],
    ) -> Result<Option<Vec<u8>>, ApprovalError> {
        self.rewrite(bytes, |subject| restore_step_columns(subject, steps))
    }
}

/// Open table of subject types, filled once at startup.
#[derive(Default)]
pub struct SubjectRegistry {
    handlers: HashMap<&'static str, Box<dyn SubjectHandler>>,
}

impl SubjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subject type that takes side effects but keeps its own
    /// status untouched.
    pub fn register<S: Subject>(self) -> Self {
        self.insert::<S>(None)
    }

    /// Register a subject type whose status follows the request outcome.
    pub fn register_synced<S: Subject + StatusSyncTarget>(self) -> Self {
        let translator: fn(&mut S, SyncOutcome) = S::sync_approval_status;
        self.insert::<S>(Some(translator))
    }

    /// Register a subject type with a translator supplied from outside the
    /// type, for subjects that cannot implement [`StatusSyncTarget`] themselves.
    pub fn register_with_translator<S: Subject>(self, translator: fn(&mut S, SyncOutcome)) -> Self {
        self.insert::<S>(Some(translator))
    }

    fn insert<S: Subject>(mut self, translator: Option<fn(&mut S, SyncOutcome)>) -> Self {
        if self
            .handlers
            .insert(S::SUBJECT_TYPE, Box::new(TypedHandler::<S> { translator }))
            .is_some()
        {
            tracing::warn!(subject_type = S::SUBJECT_TYPE, "subject type registered twice, keeping the last");
        }
        self
    }

    pub fn contains(&self, subject_type: &str) -> bool {
        self.handlers.contains_key(subject_type)
    }

    pub(crate) fn handler(&self, subject_type: &str) -> Result<&dyn SubjectHandler, ApprovalError> {
        self.handlers
            .get(subject_type)
            .map(|handler| handler.as_ref())
            .ok_or_else(|| ApprovalError::UnregisteredSubjectType(subject_type.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StepLedger;
    use crate::template::{FormType, steps_for};
    use crate::types::{Actor, TimeStamp};

    #[derive(Debug, Default, PartialEq, minicbor::Encode, minicbor::Decode)]
    struct Schedule {
        #[n(0)]
        noted_by: Option<String>,
        #[n(1)]
        approved_by: Option<String>,
        #[n(2)]
        status: String,
    }

    impl StepColumnMap for Schedule {
        fn step_code_to_column(&self) -> &[(&'static str, &'static str)] {
            &[("noted_by", "noted_by"), ("approved_by", "approved_by")]
        }

        fn sync_field(&mut self, column: &str, value: Option<&str>) -> anyhow::Result<()> {
            let slot = match column {
                "noted_by" => &mut self.noted_by,
                "approved_by" => &mut self.approved_by,
                other => anyhow::bail!("no column `{other}`"),
            };
            *slot = value.map(str::to_string);
            Ok(())
        }
    }

    impl Subject for Schedule {
        const SUBJECT_TYPE: &'static str = "schedule";

        fn step_columns(&mut self) -> Option<&mut dyn StepColumnMap> {
            Some(self)
        }
    }

    impl StatusSyncTarget for Schedule {
        fn sync_approval_status(&mut self, outcome: SyncOutcome) {
            self.status = match outcome {
                SyncOutcome::Reset => "Pending_Review",
                SyncOutcome::Rejected => "Cancelled",
                SyncOutcome::Approved => "Pending",
            }
            .to_string();
        }
    }

    #[derive(Debug, Default, minicbor::Encode, minicbor::Decode)]
    struct Plain {
        #[n(0)]
        name: String,
    }

    impl Subject for Plain {
        const SUBJECT_TYPE: &'static str = "plain";
    }

    fn approved_step() -> (ApprovalStep, ApprovalRequest) {
        let requester = Actor::new("u-1", "Ada Requester");
        let now = TimeStamp::new();
        let form = FormType::InventoryScheduling;
        let mut ledger = StepLedger::seed("req1test", steps_for(&form), &requester, &now);
        let step = ledger
            .approve(2, &Actor::new("u-2", "Grace Noter"), None, &now)
            .unwrap()
            .clone();
        let request = ApprovalRequest::new(
            "req1test".into(),
            crate::types::SubjectRef::new("schedule", "1"),
            requester,
            form,
            "Inventory".into(),
            now,
        );
        (step, request)
    }

    #[test]
    fn column_map_receives_signer_name() {
        let (step, request) = approved_step();
        let mut schedule = Schedule::default();

        assert!(apply_step_side_effects(&mut schedule, &step, &request).unwrap());
        assert_eq!(schedule.noted_by.as_deref(), Some("Grace Noter"));

        assert!(undo_step_side_effects(&mut schedule, &[step]).unwrap());
        assert_eq!(schedule.noted_by, None);
    }

    #[test]
    fn restored_columns_follow_the_steps() {
        let (step, _) = approved_step();
        let mut pending = step.clone();
        pending.step_order = 3;
        pending.code = "approved_by".into();
        pending.status = StepStatus::Pending;

        let mut schedule = Schedule {
            noted_by: None,
            approved_by: Some("Someone Stale".into()),
            status: "Draft".into(),
        };

        assert!(restore_step_columns(&mut schedule, &[step, pending]).unwrap());
        assert_eq!(schedule.noted_by.as_deref(), Some("Grace Noter"));
        assert_eq!(schedule.approved_by, None);
        assert_eq!(schedule.status, "Draft");
    }

    #[test]
    fn subject_without_capabilities_is_untouched() {
        let (step, request) = approved_step();
        let mut plain = Plain::default();
        assert!(!apply_step_side_effects(&mut plain, &step, &request).unwrap());
    }

    #[test]
    fn registry_dispatches_status_by_type_tag() {
        let registry = SubjectRegistry::new()
            .register_synced::<Schedule>()
            .register::<Plain>();
        let bytes = minicbor::to_vec(&Schedule::default()).unwrap();

        let written = registry
            .handler("schedule")
            .unwrap()
            .sync_status(&bytes, SyncOutcome::Rejected)
            .unwrap()
            .unwrap();
        let schedule: Schedule = minicbor::decode(&written).unwrap();
        assert_eq!(schedule.status, "Cancelled");

        let plain = minicbor::to_vec(&Plain::default()).unwrap();
        assert!(
            registry
                .handler("plain")
                .unwrap()
                .sync_status(&plain, SyncOutcome::Approved)
                .unwrap()
                .is_none()
        );
        assert!(matches!(
            registry.handler("unknown"),
            Err(ApprovalError::UnregisteredSubjectType(_))
        ));
    }
}
