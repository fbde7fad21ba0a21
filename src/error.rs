use crate::ledger::StepKind;
use crate::types::SubjectRef;

#[derive(thiserror::Error, Debug)]
pub enum ApprovalError {
    #[error("step {step_order} is {found}, this action needs an {expected} step")]
    InvalidStepType {
        step_order: u32,
        found: StepKind,
        expected: StepKind,
    },
    #[error("step {expected_order} of request {request_id} is no longer the current pending step")]
    StaleStep {
        request_id: String,
        expected_order: u32,
    },
    #[error("approval request {0} does not exist")]
    RequestNotFound(String),
    #[error("subject {0} does not exist")]
    SubjectNotFound(SubjectRef),
    #[error("subject {0} already has an approval request")]
    DuplicateRequest(SubjectRef),
    #[error("no subject handler registered for type `{0}`")]
    UnregisteredSubjectType(String),
    #[error("subject side effect failed")]
    SideEffect(#[source] anyhow::Error),
    #[error("failed to generate identifier")]
    Identifier(#[source] anyhow::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
    #[error(transparent)]
    Decode(#[from] minicbor::decode::Error),
    #[error(transparent)]
    Storage(#[from] sled::Error),
}

impl ApprovalError {
    /// Conflicts the caller can resolve by reloading the request and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApprovalError::StaleStep { .. })
    }
}

impl<E: std::fmt::Display> From<minicbor::encode::Error<E>> for ApprovalError {
    fn from(value: minicbor::encode::Error<E>) -> Self {
        ApprovalError::Encode(value.to_string())
    }
}
