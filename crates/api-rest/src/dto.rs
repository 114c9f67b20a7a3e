//! Request and response bodies for the REST surface.
//!
//! Domain types from `leaf-core` stay free of OpenAPI concerns; these mirror them with
//! `ToSchema` derives and flat, client-friendly shapes.

use leaf_core::{
    AggregateSummary, CohortSnapshot, Gates, IgnoredReason, NetworkCohortState, NetworkIdentity,
    Panel, QuerySession, Recorded, ResponderId, ResponseOutcome, ViewGate,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthRes {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorRes {
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ResponderRes {
    pub id: u32,
    pub name: String,
    pub enabled: bool,
    pub primary_colour: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_patients: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

impl From<NetworkIdentity> for ResponderRes {
    fn from(identity: NetworkIdentity) -> Self {
        Self {
            id: identity.id.get(),
            name: identity.name.as_str().to_owned(),
            enabled: identity.enabled,
            primary_colour: identity.primary_colour.as_str().to_owned(),
            total_patients: identity.total_patients,
            latitude: identity.latitude,
            longitude: identity.longitude,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ListRespondersRes {
    pub responders: Vec<ResponderRes>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct StartQueryReq {
    /// Query panels; each holds `sub_panels`, each of which holds `panel_items`.
    #[schema(value_type = Vec<Object>)]
    pub panels: Vec<Panel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QuerySessionRes {
    pub session_id: String,
    pub started_at: String,
}

impl From<QuerySession> for QuerySessionRes {
    fn from(session: QuerySession) -> Self {
        Self {
            session_id: session.id.to_string(),
            started_at: session.started_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct DispatchRes {
    pub kind: String,
    pub responders: Vec<u32>,
}

impl DispatchRes {
    pub fn new(kind: leaf_core::ResourceKind, responders: Vec<ResponderId>) -> Self {
        Self {
            kind: kind.to_string(),
            responders: responders.into_iter().map(ResponderId::get).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecordResponseReq {
    /// `{"loaded": {"kind": ..., "data": ...}}`, `{"failed": "message"}` or `"not_implemented"`.
    #[schema(value_type = Object)]
    pub outcome: ResponseOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct FailAggregateReq {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AggregateSummaryRes {
    pub kind: String,
    pub state: String,
    pub completed: usize,
    pub aggregate_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<AggregateSummary> for AggregateSummaryRes {
    fn from(summary: AggregateSummary) -> Self {
        let state = match summary.state {
            leaf_core::AggregateState::NotLoaded => "NOT_LOADED",
            leaf_core::AggregateState::Loading => "LOADING",
            leaf_core::AggregateState::Loaded => "LOADED",
            leaf_core::AggregateState::InError => "IN_ERROR",
        };
        Self {
            kind: summary.kind.to_string(),
            state: state.to_owned(),
            completed: summary.completed,
            aggregate_count: summary.aggregate_count,
            error: summary.error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct RecordResponseRes {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<AggregateSummaryRes>,
}

impl From<Recorded> for RecordResponseRes {
    fn from(recorded: Recorded) -> Self {
        match recorded {
            Recorded::Applied { summary } => Self {
                applied: true,
                ignored_reason: None,
                summary: Some(summary.into()),
            },
            Recorded::Ignored { reason } => {
                let reason = match reason {
                    IgnoredReason::StaleSession => "stale_session",
                    IgnoredReason::ResponderDisabled => "responder_disabled",
                    IgnoredReason::NotRequesting => "not_requesting",
                };
                Self {
                    applied: false,
                    ignored_reason: Some(reason.to_owned()),
                    summary: None,
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GateRes {
    pub allowed: bool,
    /// `too_large` or `too_small` when not allowed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i64>,
}

impl From<ViewGate> for GateRes {
    fn from(gate: ViewGate) -> Self {
        match gate {
            ViewGate::Allowed => Self {
                allowed: true,
                reason: None,
                cache_limit: None,
                threshold: None,
            },
            ViewGate::TooLarge { cache_limit } => Self {
                allowed: false,
                reason: Some("too_large".into()),
                cache_limit: Some(cache_limit),
                threshold: None,
            },
            ViewGate::TooSmall { threshold } => Self {
                allowed: false,
                reason: Some("too_small".into()),
                cache_limit: None,
                threshold: Some(threshold),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct GatesRes {
    pub patient_list: GateRes,
    pub visualization: GateRes,
}

impl From<Gates> for GatesRes {
    fn from(gates: Gates) -> Self {
        Self {
            patient_list: gates.patient_list.into(),
            visualization: gates.visualization.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ResponderCohortRes {
    pub responder: ResponderRes,
    /// Per-resource state, each `{"state": ..., "value": ...}`.
    #[schema(value_type = Object)]
    pub cohort: NetworkCohortState,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CohortRes {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<QuerySessionRes>,
    pub aggregates: Vec<AggregateSummaryRes>,
    pub gates: GatesRes,
    pub responders: Vec<ResponderCohortRes>,
}

impl From<CohortSnapshot> for CohortRes {
    fn from(snapshot: CohortSnapshot) -> Self {
        Self {
            session: snapshot.session.map(Into::into),
            aggregates: snapshot.aggregates.into_iter().map(Into::into).collect(),
            gates: snapshot.gates.into(),
            responders: snapshot
                .responders
                .into_iter()
                .map(|r| ResponderCohortRes {
                    responder: r.identity.into(),
                    cohort: r.state,
                })
                .collect(),
        }
    }
}
