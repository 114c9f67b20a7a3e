use crate::state::{CohortStateType, ResourceKind};
use leaf_types::ResponderId;
use uuid::Uuid;

/// Reasons an enable/disable request for a responder is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ToggleRejection {
    #[error("At least one responder must be enabled in order to run queries.")]
    LastEnabledResponder,
    #[error("Responders cannot be enabled or disabled while a query is running.")]
    RequestInFlight,
}

#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to read configuration file: {0}")]
    ConfigRead(std::io::Error),
    #[error("configuration schema mismatch at {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("unknown responder: {0}")]
    UnknownResponder(ResponderId),
    #[error("responder {0} is disabled")]
    ResponderDisabled(ResponderId),
    #[error("no responders are enabled")]
    NoEnabledResponders,
    #[error("responder {0} has no loaded count")]
    CountNotLoaded(ResponderId),
    #[error("duplicate responder id: {0}")]
    DuplicateResponder(ResponderId),
    #[error("{0}")]
    ToggleRejected(#[from] ToggleRejection),

    #[error("no query session is active")]
    NoActiveSession,
    #[error("query session {0} is no longer current")]
    StaleSession(Uuid),
    #[error("cannot resolve {kind} for responder {responder} from state {from}")]
    InvalidTransition {
        responder: ResponderId,
        kind: ResourceKind,
        from: CohortStateType,
    },
    #[error("payload does not match resource kind {0}")]
    PayloadMismatch(ResourceKind),
}

pub type CohortResult<T> = std::result::Result<T, CohortError>;
