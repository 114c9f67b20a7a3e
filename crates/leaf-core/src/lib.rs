//! # Leaf Core
//!
//! Federated cohort aggregation for the Leaf query network.
//!
//! This crate contains the pure domain logic:
//! - Canonical query signatures (`signature`)
//! - Deterministic count obfuscation (`obfuscation`)
//! - Per-responder resource state machines (`state`)
//! - Responder identities and the toggle guard (`responder`)
//! - The federation-wide aggregator and view gates (`aggregator`)
//!
//! **No API concerns**: HTTP servers and command-line handling belong in `api-rest` and `leaf-cli`.

pub mod aggregator;
pub mod config;
pub mod constants;
pub mod error;
pub mod obfuscation;
pub mod panel;
pub mod responder;
pub mod signature;
pub mod state;

pub use aggregator::{
    AggregateState, AggregateSummary, CohortAggregator, CohortSnapshot, Gates, IgnoredReason,
    QuerySession, Recorded, ResponderSnapshot, ViewGate,
};
pub use config::{
    config_path_from_env_value, CoreConfig, LowCellMasking, Noise, ObfuscationPolicy,
    ObfuscationSite,
};
pub use error::{CohortError, CohortResult, ToggleRejection};
pub use obfuscation::{obfuscate, obfuscate_query, PatientCount};
pub use panel::{parse_panels, Concept, ConceptId, Panel, PanelItem, SubPanel};
pub use responder::{validate_toggle, NetworkIdentity, ResponderRegistry};
pub use signature::canonicalize;
pub use state::{
    CohortStateType, NetworkCohortState, NoteSearchResult, ResourceKind, ResourcePayload,
    ResourceState, ResponseOutcome,
};

pub use leaf_types::{HexColour, NonEmptyText, ResponderId};
