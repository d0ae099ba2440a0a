use crate::compiler::ValidationIssue;
use crate::types::{ActId, ContId, LinkId};
use thiserror::Error;
use uuid::Uuid;

/// Infrastructure and management-API errors. Process-level faults are not
/// errors — they are `FaultInfo` data flowing through completions and
/// handled by scope fault handlers.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown process `{0}`")]
    UnknownProcess(String),

    #[error("unknown instance {0}")]
    UnknownInstance(Uuid),

    #[error("instance {0} is not running")]
    NotRunning(Uuid),

    #[error("deployment rejected ({} issues)", .0.len())]
    Validation(Vec<ValidationIssue>),

    #[error("continuation {0} not found")]
    MissingContinuation(ContId),

    #[error("activity {0} out of bounds")]
    MissingActivity(ActId),

    #[error("partner link {0} out of bounds")]
    MissingPartnerLink(LinkId),

    #[error("store failure: {0}")]
    Store(#[source] anyhow::Error),

    #[error("binding failure: {0}")]
    Binding(#[source] anyhow::Error),
}
