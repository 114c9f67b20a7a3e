//! Per-responder resource state machines.
//!
//! Every responder tracks one [`ResourceState`] per [`ResourceKind`]:
//!
//! ```text
//! NOT_LOADED -> REQUESTING -> LOADED | IN_ERROR | NOT_IMPLEMENTED
//!      ^            ^                        |
//!      |            +----- re-dispatch ------+
//!      +--------------- session reset -------+
//! ```
//!
//! Any state can move back to `REQUESTING` when a resource is dispatched again. Only a
//! `REQUESTING` resource can be resolved.

use crate::error::{CohortError, CohortResult};
use crate::obfuscation::PatientCount;
use leaf_types::ResponderId;
use serde::{Deserialize, Serialize};

/// The kinds of result a responder can be asked for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Count,
    PatientList,
    Visualization,
    NoteSearch,
}

impl ResourceKind {
    /// Resources that can only be requested from a responder whose count has loaded.
    pub fn requires_count(&self) -> bool {
        matches!(self, ResourceKind::PatientList | ResourceKind::Visualization)
    }

    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Count,
        ResourceKind::PatientList,
        ResourceKind::Visualization,
        ResourceKind::NoteSearch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Count => "count",
            ResourceKind::PatientList => "patient_list",
            ResourceKind::Visualization => "visualization",
            ResourceKind::NoteSearch => "note_search",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown resource kind: {s}"))
    }
}

/// State tag without its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CohortStateType {
    NotLoaded,
    Requesting,
    Loaded,
    InError,
    NotImplemented,
}

impl std::fmt::Display for CohortStateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CohortStateType::NotLoaded => "NOT_LOADED",
            CohortStateType::Requesting => "REQUESTING",
            CohortStateType::Loaded => "LOADED",
            CohortStateType::InError => "IN_ERROR",
            CohortStateType::NotImplemented => "NOT_IMPLEMENTED",
        };
        f.write_str(name)
    }
}

pub type PatientListRows = Vec<serde_json::Map<String, serde_json::Value>>;

/// Note search hits returned by one responder.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NoteSearchResult {
    pub total_hits: u64,
    #[serde(default)]
    pub documents: Vec<serde_json::Value>,
}

/// Loaded data for one resource.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResourcePayload {
    Count(PatientCount),
    PatientList(PatientListRows),
    Visualization(serde_json::Value),
    NoteSearch(NoteSearchResult),
}

impl ResourcePayload {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourcePayload::Count(_) => ResourceKind::Count,
            ResourcePayload::PatientList(_) => ResourceKind::PatientList,
            ResourcePayload::Visualization(_) => ResourceKind::Visualization,
            ResourcePayload::NoteSearch(_) => ResourceKind::NoteSearch,
        }
    }
}

/// How a responder answered a request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseOutcome {
    Loaded(ResourcePayload),
    Failed(String),
    NotImplemented,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(tag = "state", content = "value", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResourceState {
    #[default]
    NotLoaded,
    Requesting,
    Loaded(ResourcePayload),
    InError(String),
    NotImplemented,
}

impl ResourceState {
    pub fn state_type(&self) -> CohortStateType {
        match self {
            ResourceState::NotLoaded => CohortStateType::NotLoaded,
            ResourceState::Requesting => CohortStateType::Requesting,
            ResourceState::Loaded(_) => CohortStateType::Loaded,
            ResourceState::InError(_) => CohortStateType::InError,
            ResourceState::NotImplemented => CohortStateType::NotImplemented,
        }
    }

    pub fn is_requesting(&self) -> bool {
        matches!(self, ResourceState::Requesting)
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, ResourceState::Loaded(_))
    }

    /// The loaded count, if this is a loaded count resource.
    pub fn count(&self) -> Option<PatientCount> {
        match self {
            ResourceState::Loaded(ResourcePayload::Count(count)) => Some(*count),
            _ => None,
        }
    }
}

/// All resource states for one responder.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct NetworkCohortState {
    pub count: ResourceState,
    pub patient_list: ResourceState,
    pub visualization: ResourceState,
    pub note_search: ResourceState,
}

impl NetworkCohortState {
    pub fn get(&self, kind: ResourceKind) -> &ResourceState {
        match kind {
            ResourceKind::Count => &self.count,
            ResourceKind::PatientList => &self.patient_list,
            ResourceKind::Visualization => &self.visualization,
            ResourceKind::NoteSearch => &self.note_search,
        }
    }

    fn slot(&mut self, kind: ResourceKind) -> &mut ResourceState {
        match kind {
            ResourceKind::Count => &mut self.count,
            ResourceKind::PatientList => &mut self.patient_list,
            ResourceKind::Visualization => &mut self.visualization,
            ResourceKind::NoteSearch => &mut self.note_search,
        }
    }

    /// True if any resource is waiting on the responder.
    pub fn any_requesting(&self) -> bool {
        ResourceKind::ALL
            .into_iter()
            .any(|kind| self.get(kind).is_requesting())
    }

    /// Dispatch `kind`: moves it to `REQUESTING` from any state.
    pub fn begin(&mut self, kind: ResourceKind) {
        *self.slot(kind) = ResourceState::Requesting;
    }

    /// Resolve a `REQUESTING` resource with the responder's answer.
    ///
    /// A new count invalidates the patient list and visualisation loaded for an earlier count,
    /// so a loaded count resets both to `NOT_LOADED`. Note search is independent of the count. A failed or unsupported count carries its
    /// state over to the patient list and visualisation, which cannot be produced without it.
    pub fn resolve(
        &mut self,
        responder: ResponderId,
        kind: ResourceKind,
        outcome: ResponseOutcome,
    ) -> CohortResult<()> {
        let current = self.get(kind);
        if !current.is_requesting() {
            return Err(CohortError::InvalidTransition {
                responder,
                kind,
                from: current.state_type(),
            });
        }

        let next = match outcome {
            ResponseOutcome::Loaded(payload) => {
                if payload.kind() != kind {
                    return Err(CohortError::PayloadMismatch(kind));
                }
                ResourceState::Loaded(payload)
            }
            ResponseOutcome::Failed(message) => ResourceState::InError(message),
            ResponseOutcome::NotImplemented => ResourceState::NotImplemented,
        };

        if kind == ResourceKind::Count {
            match &next {
                ResourceState::Loaded(_) => {
                    self.patient_list = ResourceState::NotLoaded;
                    self.visualization = ResourceState::NotLoaded;
                }
                ResourceState::InError(_) | ResourceState::NotImplemented => {
                    self.patient_list = next.clone();
                    self.visualization = next.clone();
                }
                ResourceState::NotLoaded | ResourceState::Requesting => {}
            }
        }

        *self.slot(kind) = next;
        Ok(())
    }

    /// Return every resource to `NOT_LOADED`.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
