//! Federation-wide cohort aggregation.
//!
//! [`CohortAggregator`] owns the per-responder state machines for the current query session and
//! derives the network totals and view gates from them. Responses from different responders are
//! applied independently: each responder's entry is its own `DashMap` slot, so one slow or failing
//! node never blocks another. Every mutation returns the freshly recomputed summary for the
//! affected resource kind; all read methods are pure functions of the current state.
//!
//! Lock order is session, then registry, then state map. No path acquires them in another order.

use crate::config::{CoreConfig, ObfuscationSite};
use crate::error::{CohortError, CohortResult};
use crate::obfuscation::obfuscate;
use crate::panel::Panel;
use crate::responder::{NetworkIdentity, ResponderRegistry};
use crate::signature::canonicalize;
use crate::state::{
    CohortStateType, NetworkCohortState, ResourceKind, ResourcePayload, ResponseOutcome,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use leaf_types::ResponderId;
use serde::Serialize;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use uuid::Uuid;

/// The query currently being evaluated across the federation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct QuerySession {
    pub id: Uuid,
    /// Canonical signature of the query, used to seed count noise.
    #[serde(skip)]
    pub signature: String,
    pub started_at: DateTime<Utc>,
}

/// Federation-wide state of one resource kind, for display.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AggregateState {
    NotLoaded,
    Loading,
    Loaded,
    InError,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AggregateSummary {
    pub kind: ResourceKind,
    pub state: AggregateState,
    /// Enabled responders whose `kind` resource is loaded.
    pub completed: usize,
    /// Sum of loaded counts over enabled responders.
    pub aggregate_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Whether a downstream view may be rendered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "gate", rename_all = "snake_case")]
pub enum ViewGate {
    Allowed,
    /// Single-responder cohort larger than the cache limit.
    TooLarge { cache_limit: u64 },
    /// Cohort at or below the low-cell threshold; visualisations could reveal structure.
    TooSmall { threshold: i64 },
}

impl ViewGate {
    pub fn is_allowed(&self) -> bool {
        matches!(self, ViewGate::Allowed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Gates {
    pub patient_list: ViewGate,
    pub visualization: ViewGate,
}

/// Result of applying a responder's response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Recorded {
    Applied { summary: AggregateSummary },
    Ignored { reason: IgnoredReason },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoredReason {
    /// The response answers a session that has ended or been replaced.
    StaleSession,
    /// The responder was disabled after dispatch.
    ResponderDisabled,
    /// The resource was not waiting for a response.
    NotRequesting,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResponderSnapshot {
    pub identity: NetworkIdentity,
    pub state: NetworkCohortState,
}

/// Read-only view of everything the aggregator knows.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CohortSnapshot {
    pub session: Option<QuerySession>,
    pub responders: Vec<ResponderSnapshot>,
    pub aggregates: Vec<AggregateSummary>,
    pub gates: Gates,
}

/// Tracks every responder's progress for the current query and derives the aggregate view.
#[derive(Debug)]
pub struct CohortAggregator {
    cfg: Arc<CoreConfig>,
    session: RwLock<Option<QuerySession>>,
    registry: ResponderRegistry,
    cohorts: DashMap<ResponderId, NetworkCohortState>,
    aggregate_errors: DashMap<ResourceKind, String>,
}

impl CohortAggregator {
    /// Creates an aggregator for the responders named in `cfg`, all `NOT_LOADED`.
    pub fn new(cfg: Arc<CoreConfig>) -> Self {
        let registry = ResponderRegistry::new(cfg.responders().iter().cloned());
        let cohorts = cfg
            .responders()
            .iter()
            .map(|r| (r.id, NetworkCohortState::default()))
            .collect();

        Self {
            cfg,
            session: RwLock::new(None),
            registry,
            cohorts,
            aggregate_errors: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.cfg
    }

    pub fn responders(&self) -> Vec<NetworkIdentity> {
        self.registry.list()
    }

    pub fn current_session(&self) -> Option<QuerySession> {
        self.read_session().clone()
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Start a new query session and dispatch the count to every enabled responder.
    ///
    /// Any previous session is replaced; late responses for it are ignored.
    pub fn start_query(&self, panels: &[Panel]) -> CohortResult<QuerySession> {
        let session = QuerySession {
            id: Uuid::new_v4(),
            signature: canonicalize(panels),
            started_at: Utc::now(),
        };

        let mut current = self.write_session();
        let enabled = self.registry.enabled_ids();
        if enabled.is_empty() {
            return Err(CohortError::NoEnabledResponders);
        }

        self.aggregate_errors.clear();
        for mut entry in self.cohorts.iter_mut() {
            let id = *entry.key();
            let state = entry.value_mut();
            state.reset();
            if enabled.contains(&id) {
                state.begin(ResourceKind::Count);
            }
        }

        tracing::info!(
            session = %session.id,
            responders = enabled.len(),
            "started cohort count query"
        );

        *current = Some(session.clone());
        Ok(session)
    }

    /// Dispatch a resource to the enabled responders that can answer it.
    ///
    /// The count and note search go to every enabled responder. The patient list and
    /// visualisation only go to responders whose count is `LOADED`. Returns the responders that
    /// were moved to `REQUESTING`.
    pub fn start_resource(
        &self,
        session_id: Uuid,
        kind: ResourceKind,
    ) -> CohortResult<Vec<ResponderId>> {
        let session = self.read_session();
        ensure_current(&session, session_id)?;

        self.aggregate_errors.remove(&kind);
        let mut dispatched = Vec::new();
        for id in self.registry.enabled_ids() {
            if let Some(mut state) = self.cohorts.get_mut(&id) {
                if kind.requires_count() && !state.count.is_loaded() {
                    continue;
                }
                state.begin(kind);
                dispatched.push(id);
            }
        }

        tracing::info!(session = %session_id, %kind, responders = dispatched.len(), "dispatched resource");
        Ok(dispatched)
    }

    /// Re-dispatch one resource to one enabled responder.
    pub fn retry_responder(
        &self,
        session_id: Uuid,
        responder: ResponderId,
        kind: ResourceKind,
    ) -> CohortResult<AggregateSummary> {
        let session = self.read_session();
        ensure_current(&session, session_id)?;

        let identity = self.registry.get(responder)?;
        if !identity.enabled {
            return Err(CohortError::ResponderDisabled(responder));
        }

        {
            let mut state = self
                .cohorts
                .get_mut(&responder)
                .ok_or(CohortError::UnknownResponder(responder))?;
            if kind.requires_count() && !state.count.is_loaded() {
                return Err(CohortError::CountNotLoaded(responder));
            }
            state.begin(kind);
        }

        tracing::debug!(session = %session_id, %responder, %kind, "re-dispatched resource");
        Ok(self.summary(kind))
    }

    /// Apply one responder's answer for `kind`.
    ///
    /// Responses for a session that is no longer current, for a responder that has since been
    /// disabled, or for a resource that is not `REQUESTING` are ignored rather than treated as
    /// errors: they are the normal result of responders answering late.
    pub fn record_response(
        &self,
        session_id: Uuid,
        responder: ResponderId,
        kind: ResourceKind,
        outcome: ResponseOutcome,
    ) -> CohortResult<Recorded> {
        let guard = self.read_session();
        let session = match ensure_current(&guard, session_id) {
            Ok(session) => session,
            Err(_) => {
                tracing::warn!(session = %session_id, %responder, %kind, "ignored response for stale session");
                return Ok(Recorded::Ignored {
                    reason: IgnoredReason::StaleSession,
                });
            }
        };

        let identity = self.registry.get(responder)?;
        if !identity.enabled {
            tracing::warn!(%responder, %kind, "ignored response from disabled responder");
            return Ok(Recorded::Ignored {
                reason: IgnoredReason::ResponderDisabled,
            });
        }

        let outcome = self.obfuscate_outcome(session, outcome);

        {
            let mut state = self
                .cohorts
                .get_mut(&responder)
                .ok_or(CohortError::UnknownResponder(responder))?;

            match state.resolve(responder, kind, outcome) {
                Ok(()) => {}
                Err(CohortError::InvalidTransition { from, .. }) => {
                    tracing::warn!(%responder, %kind, %from, "ignored response for resource that is not requesting");
                    return Ok(Recorded::Ignored {
                        reason: IgnoredReason::NotRequesting,
                    });
                }
                Err(err) => return Err(err),
            }

            tracing::debug!(
                %responder,
                %kind,
                state = %state.get(kind).state_type(),
                "recorded responder response"
            );
        }

        Ok(Recorded::Applied {
            summary: self.summary(kind),
        })
    }

    /// Mark the federation-wide `kind` resource as failed, e.g. because dispatch itself failed.
    pub fn fail_aggregate(
        &self,
        session_id: Uuid,
        kind: ResourceKind,
        message: impl Into<String>,
    ) -> CohortResult<AggregateSummary> {
        let session = self.read_session();
        ensure_current(&session, session_id)?;

        let message = message.into();
        tracing::error!(session = %session_id, %kind, %message, "aggregate resource failed");
        self.aggregate_errors.insert(kind, message);

        Ok(self.summary(kind))
    }

    /// End the session and discard all responder state.
    pub fn end_query(&self, session_id: Uuid) -> CohortResult<()> {
        let mut session = self.write_session();
        ensure_current(&session, session_id)?;

        for mut entry in self.cohorts.iter_mut() {
            entry.value_mut().reset();
        }
        self.aggregate_errors.clear();
        *session = None;

        tracing::info!(session = %session_id, "ended cohort query");
        Ok(())
    }

    /// Enable or disable a responder, subject to the toggle guard.
    ///
    /// Holds the session lock so no dispatch can run between the in-flight check and the flip.
    pub fn toggle_responder(&self, responder: ResponderId) -> CohortResult<NetworkIdentity> {
        let _session = self.write_session();
        let updated = self.registry.toggle(responder, || {
            self.cohorts
                .get(&responder)
                .is_some_and(|state| state.any_requesting())
        });

        match &updated {
            Ok(identity) => {
                tracing::info!(%responder, enabled = identity.enabled, "toggled responder")
            }
            Err(err) => tracing::info!(%responder, %err, "rejected responder toggle"),
        }

        updated
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Sum of loaded counts over enabled responders.
    pub fn aggregate_count(&self) -> i64 {
        self.registry
            .enabled_ids()
            .iter()
            .filter_map(|id| self.cohorts.get(id).and_then(|state| state.count.count()))
            .fold(0i64, |total, count| total.saturating_add(count.value))
    }

    /// Number of enabled responders whose `kind` resource is loaded.
    pub fn completed_count(&self, kind: ResourceKind) -> usize {
        self.enabled_states(kind)
            .into_iter()
            .filter(|state| *state == CohortStateType::Loaded)
            .count()
    }

    pub fn overall_state(&self, kind: ResourceKind) -> AggregateState {
        self.summary(kind).state
    }

    /// Recompute the summary for `kind` from the current responder states.
    pub fn summary(&self, kind: ResourceKind) -> AggregateSummary {
        let error = self.aggregate_errors.get(&kind).map(|e| e.value().clone());
        let states = self.enabled_states(kind);

        AggregateSummary {
            kind,
            state: overall_state(&states, error.is_some()),
            completed: states
                .iter()
                .filter(|state| **state == CohortStateType::Loaded)
                .count(),
            aggregate_count: self.aggregate_count(),
            error,
        }
    }

    /// View gates for the current aggregate count.
    pub fn gates(&self) -> Gates {
        gates(
            self.registry.enabled_ids().len(),
            self.aggregate_count(),
            self.cfg.cache_limit(),
            self.cfg.low_cell_masking_threshold(),
        )
    }

    pub fn snapshot(&self) -> CohortSnapshot {
        let session = self.current_session();
        let responders = self
            .registry
            .list()
            .into_iter()
            .map(|identity| {
                let state = self
                    .cohorts
                    .get(&identity.id)
                    .map(|s| s.value().clone())
                    .unwrap_or_default();
                ResponderSnapshot { identity, state }
            })
            .collect();

        CohortSnapshot {
            session,
            responders,
            aggregates: ResourceKind::ALL.into_iter().map(|k| self.summary(k)).collect(),
            gates: self.gates(),
        }
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    fn enabled_states(&self, kind: ResourceKind) -> Vec<CohortStateType> {
        self.registry
            .enabled_ids()
            .iter()
            .filter_map(|id| self.cohorts.get(id).map(|state| state.get(kind).state_type()))
            .collect()
    }

    fn obfuscate_outcome(&self, session: &QuerySession, outcome: ResponseOutcome) -> ResponseOutcome {
        match (self.cfg.obfuscation_site(), outcome) {
            (ObfuscationSite::Aggregator, ResponseOutcome::Loaded(ResourcePayload::Count(raw))) => {
                let count = obfuscate(raw, &session.signature, self.cfg.policy());
                ResponseOutcome::Loaded(ResourcePayload::Count(count))
            }
            (_, outcome) => outcome,
        }
    }

    fn read_session(&self) -> RwLockReadGuard<'_, Option<QuerySession>> {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, Option<QuerySession>> {
        self.session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn ensure_current(session: &Option<QuerySession>, id: Uuid) -> CohortResult<&QuerySession> {
    match session {
        Some(current) if current.id == id => Ok(current),
        Some(_) => Err(CohortError::StaleSession(id)),
        None => Err(CohortError::NoActiveSession),
    }
}

/// Display state of a resource from the states of the enabled responders.
///
/// Loaded once at least one responder has loaded and none is still requesting; loading while
/// any responder has been asked; errored only when the aggregate itself is marked failed.
pub fn overall_state(states: &[CohortStateType], aggregate_failed: bool) -> AggregateState {
    if aggregate_failed {
        return AggregateState::InError;
    }

    let completed = states.iter().any(|s| *s == CohortStateType::Loaded);
    let requesting = states.iter().any(|s| *s == CohortStateType::Requesting);

    if completed && !requesting {
        AggregateState::Loaded
    } else if states.iter().any(|s| *s != CohortStateType::NotLoaded) {
        AggregateState::Loading
    } else {
        AggregateState::NotLoaded
    }
}

/// Gate patient-level views and visualisations on the aggregate count.
///
/// A single-responder cohort above `cache_limit` blocks both views. Otherwise a cohort at or
/// below `low_cell_threshold` blocks visualisations only.
pub fn gates(
    enabled_responders: usize,
    aggregate_count: i64,
    cache_limit: u64,
    low_cell_threshold: i64,
) -> Gates {
    let too_large =
        enabled_responders == 1 && u64::try_from(aggregate_count).is_ok_and(|n| n > cache_limit);

    if too_large {
        let gate = ViewGate::TooLarge { cache_limit };
        return Gates {
            patient_list: gate,
            visualization: gate,
        };
    }

    let visualization = if aggregate_count <= low_cell_threshold {
        ViewGate::TooSmall {
            threshold: low_cell_threshold,
        }
    } else {
        ViewGate::Allowed
    };

    Gates {
        patient_list: ViewGate::Allowed,
        visualization,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LowCellMasking, Noise, ObfuscationPolicy};
    use crate::obfuscation::PatientCount;
    use crate::panel::SubPanel;
    use leaf_types::{HexColour, NonEmptyText};

    fn identity(id: u32) -> NetworkIdentity {
        NetworkIdentity {
            id: ResponderId::new(id),
            name: NonEmptyText::new(format!("Node {id}")).unwrap(),
            enabled: true,
            primary_colour: HexColour::parse("#4a90e2").unwrap(),
            total_patients: None,
            latitude: None,
            longitude: None,
        }
    }

    fn config(
        policy: ObfuscationPolicy,
        site: ObfuscationSite,
        cache_limit: u64,
        responders: u32,
    ) -> Arc<CoreConfig> {
        Arc::new(
            CoreConfig::new(
                policy,
                site,
                cache_limit,
                Some(10),
                (1..=responders).map(identity).collect(),
            )
            .unwrap(),
        )
    }

    fn plain(responders: u32) -> CohortAggregator {
        CohortAggregator::new(config(
            ObfuscationPolicy::disabled(),
            ObfuscationSite::Aggregator,
            1000,
            responders,
        ))
    }

    fn query() -> Vec<Panel> {
        vec![Panel::new(vec![SubPanel::of(["c1", "c2"])])]
    }

    fn count(value: i64) -> ResponseOutcome {
        ResponseOutcome::Loaded(ResourcePayload::Count(PatientCount::raw(value)))
    }

    fn id(n: u32) -> ResponderId {
        ResponderId::new(n)
    }

    #[test]
    fn aggregates_loaded_counts_while_others_pending() {
        let agg = plain(3);
        let session = agg.start_query(&query()).unwrap();

        agg.record_response(session.id, id(1), ResourceKind::Count, count(100)).unwrap();
        agg.record_response(session.id, id(2), ResourceKind::Count, count(150)).unwrap();

        assert_eq!(agg.aggregate_count(), 250);
        assert_eq!(agg.completed_count(ResourceKind::Count), 2);
        assert_eq!(agg.overall_state(ResourceKind::Count), AggregateState::Loading);

        let recorded = agg
            .record_response(session.id, id(3), ResourceKind::Count, count(50))
            .unwrap();
        match recorded {
            Recorded::Applied { summary } => {
                assert_eq!(summary.state, AggregateState::Loaded);
                assert_eq!(summary.aggregate_count, 300);
                assert_eq!(summary.completed, 3);
            }
            other => panic!("expected applied, got {other:?}"),
        }
    }

    #[test]
    fn arrival_order_does_not_matter() {
        let forward = plain(3);
        let backward = plain(3);
        let s1 = forward.start_query(&query()).unwrap();
        let s2 = backward.start_query(&query()).unwrap();

        for n in [1, 2, 3] {
            forward
                .record_response(s1.id, id(n), ResourceKind::Count, count(i64::from(n) * 10))
                .unwrap();
        }
        for n in [3, 2, 1] {
            backward
                .record_response(s2.id, id(n), ResourceKind::Count, count(i64::from(n) * 10))
                .unwrap();
        }

        assert_eq!(forward.summary(ResourceKind::Count), backward.summary(ResourceKind::Count));
    }

    #[test]
    fn responder_failure_is_isolated() {
        let agg = plain(2);
        let session = agg.start_query(&query()).unwrap();

        agg.record_response(
            session.id,
            id(1),
            ResourceKind::Count,
            ResponseOutcome::Failed("connection refused".into()),
        )
        .unwrap();
        agg.record_response(session.id, id(2), ResourceKind::Count, count(80)).unwrap();

        assert_eq!(agg.aggregate_count(), 80);
        assert_eq!(agg.completed_count(ResourceKind::Count), 1);
        assert_eq!(agg.overall_state(ResourceKind::Count), AggregateState::Loaded);
    }

    #[test]
    fn aggregate_failure_overrides_responder_states() {
        let agg = plain(2);
        let session = agg.start_query(&query()).unwrap();
        agg.record_response(session.id, id(1), ResourceKind::Count, count(80)).unwrap();

        let summary = agg
            .fail_aggregate(session.id, ResourceKind::Count, "dispatch failed")
            .unwrap();
        assert_eq!(summary.state, AggregateState::InError);
        assert_eq!(summary.error.as_deref(), Some("dispatch failed"));
    }

    #[test]
    fn nothing_requested_is_not_loaded() {
        let agg = plain(2);
        assert_eq!(agg.overall_state(ResourceKind::Count), AggregateState::NotLoaded);
        assert!(agg.current_session().is_none());
    }

    #[test]
    fn stale_session_responses_are_ignored() {
        let agg = plain(2);
        let first = agg.start_query(&query()).unwrap();
        let second = agg.start_query(&query()).unwrap();

        let recorded = agg
            .record_response(first.id, id(1), ResourceKind::Count, count(99))
            .unwrap();
        assert_eq!(
            recorded,
            Recorded::Ignored {
                reason: IgnoredReason::StaleSession
            }
        );
        assert_eq!(agg.aggregate_count(), 0);

        agg.end_query(second.id).unwrap();
        let recorded = agg
            .record_response(second.id, id(1), ResourceKind::Count, count(99))
            .unwrap();
        assert!(matches!(recorded, Recorded::Ignored { .. }));
    }

    #[test]
    fn duplicate_response_is_ignored() {
        let agg = plain(2);
        let session = agg.start_query(&query()).unwrap();
        agg.record_response(session.id, id(1), ResourceKind::Count, count(10)).unwrap();

        let recorded = agg
            .record_response(session.id, id(1), ResourceKind::Count, count(20))
            .unwrap();
        assert_eq!(
            recorded,
            Recorded::Ignored {
                reason: IgnoredReason::NotRequesting
            }
        );
        assert_eq!(agg.aggregate_count(), 10);
    }

    #[test]
    fn single_responder_over_cache_limit_is_too_large() {
        let agg = plain(1);
        let session = agg.start_query(&query()).unwrap();
        agg.record_response(session.id, id(1), ResourceKind::Count, count(5000)).unwrap();

        let gates = agg.gates();
        assert_eq!(gates.patient_list, ViewGate::TooLarge { cache_limit: 1000 });
        assert_eq!(gates.visualization, ViewGate::TooLarge { cache_limit: 1000 });
    }

    #[test]
    fn too_large_ignores_responder_state() {
        assert_eq!(
            gates(1, 5000, 1000, 10).patient_list,
            ViewGate::TooLarge { cache_limit: 1000 }
        );
        assert!(gates(2, 5000, 1000, 10).patient_list.is_allowed());
    }

    #[test]
    fn too_large_takes_precedence_over_too_small() {
        let g = gates(1, 5, 3, 10);
        assert_eq!(g.patient_list, ViewGate::TooLarge { cache_limit: 3 });
        assert_eq!(g.visualization, ViewGate::TooLarge { cache_limit: 3 });

        let agg = CohortAggregator::new(config(
            ObfuscationPolicy::disabled(),
            ObfuscationSite::Aggregator,
            3,
            1,
        ));
        let session = agg.start_query(&query()).unwrap();
        agg.record_response(session.id, id(1), ResourceKind::Count, count(5)).unwrap();
        assert_eq!(agg.gates().visualization, ViewGate::TooLarge { cache_limit: 3 });
    }

    #[test]
    fn small_cohort_blocks_visualization_only() {
        let g = gates(3, 10, 1000, 10);
        assert!(g.patient_list.is_allowed());
        assert_eq!(g.visualization, ViewGate::TooSmall { threshold: 10 });
        assert!(gates(3, 11, 1000, 10).visualization.is_allowed());
    }

    #[test]
    fn last_enabled_responder_toggle_is_rejected() {
        let agg = plain(1);
        let err = agg.toggle_responder(id(1)).expect_err("last responder");
        assert!(matches!(err, CohortError::ToggleRejected(_)));
        assert!(agg.responders()[0].enabled);
    }

    #[test]
    fn toggle_rejected_while_requesting() {
        let agg = plain(2);
        agg.start_query(&query()).unwrap();
        let err = agg.toggle_responder(id(2)).expect_err("in flight");
        assert!(matches!(
            err,
            CohortError::ToggleRejected(crate::error::ToggleRejection::RequestInFlight)
        ));
    }

    #[test]
    fn disabled_responder_leaves_the_aggregate() {
        let agg = plain(2);
        let session = agg.start_query(&query()).unwrap();
        agg.record_response(session.id, id(1), ResourceKind::Count, count(40)).unwrap();
        agg.record_response(session.id, id(2), ResourceKind::Count, count(60)).unwrap();
        assert_eq!(agg.aggregate_count(), 100);

        let updated = agg.toggle_responder(id(2)).unwrap();
        assert!(!updated.enabled);
        assert_eq!(agg.aggregate_count(), 40);
        assert_eq!(agg.completed_count(ResourceKind::Count), 1);

        agg.toggle_responder(id(2)).unwrap();
        assert_eq!(agg.aggregate_count(), 100);
    }

    #[test]
    fn disabled_responders_are_not_dispatched() {
        let agg = plain(2);
        agg.toggle_responder(id(2)).unwrap();
        let session = agg.start_query(&query()).unwrap();

        let snapshot = agg.snapshot();
        assert_eq!(snapshot.session.map(|s| s.id), Some(session.id));
        assert!(snapshot.responders[0].state.count.is_requesting());
        assert_eq!(snapshot.responders[1].state.count.state_type(), CohortStateType::NotLoaded);

        let recorded = agg
            .record_response(session.id, id(2), ResourceKind::Count, count(5))
            .unwrap();
        assert_eq!(
            recorded,
            Recorded::Ignored {
                reason: IgnoredReason::ResponderDisabled
            }
        );
    }

    #[test]
    fn central_obfuscation_uses_session_signature() {
        let policy = ObfuscationPolicy::new(
            true,
            LowCellMasking {
                enabled: true,
                threshold: 10,
            },
            Noise {
                enabled: true,
                lower_bound: -5,
                upper_bound: 5,
            },
        )
        .unwrap();
        let agg = CohortAggregator::new(config(policy, ObfuscationSite::Aggregator, 1000, 2));
        let session = agg.start_query(&query()).unwrap();

        agg.record_response(session.id, id(1), ResourceKind::Count, count(3)).unwrap();
        agg.record_response(session.id, id(2), ResourceKind::Count, count(500)).unwrap();

        let snapshot = agg.snapshot();
        let masked = snapshot.responders[0].state.count.count().unwrap();
        assert_eq!(masked, PatientCount { value: 10, plus_minus: 10, within_low_cell_threshold: true });

        let noised = snapshot.responders[1].state.count.count().unwrap();
        let expected = obfuscate(PatientCount::raw(500), &canonicalize(&query()), &policy);
        assert_eq!(noised, expected);
        assert_ne!(noised.value, 500);
    }

    #[test]
    fn responder_side_obfuscation_stores_counts_as_received() {
        let policy = ObfuscationPolicy::new(
            true,
            LowCellMasking {
                enabled: true,
                threshold: 10,
            },
            Noise::default(),
        )
        .unwrap();
        let agg = CohortAggregator::new(config(policy, ObfuscationSite::Responder, 1000, 1));
        let session = agg.start_query(&query()).unwrap();
        agg.record_response(session.id, id(1), ResourceKind::Count, count(3)).unwrap();

        assert_eq!(agg.aggregate_count(), 3);
    }

    #[test]
    fn detail_resources_follow_their_own_lifecycle() {
        let agg = plain(2);
        let session = agg.start_query(&query()).unwrap();
        agg.record_response(session.id, id(1), ResourceKind::Count, count(40)).unwrap();
        agg.record_response(session.id, id(2), ResourceKind::Count, count(60)).unwrap();

        let dispatched = agg.start_resource(session.id, ResourceKind::Visualization).unwrap();
        assert_eq!(dispatched, vec![id(1), id(2)]);
        assert_eq!(agg.overall_state(ResourceKind::Visualization), AggregateState::Loading);

        agg.record_response(
            session.id,
            id(1),
            ResourceKind::Visualization,
            ResponseOutcome::Loaded(ResourcePayload::Visualization(serde_json::json!({"age": []}))),
        )
        .unwrap();
        agg.record_response(
            session.id,
            id(2),
            ResourceKind::Visualization,
            ResponseOutcome::NotImplemented,
        )
        .unwrap();

        assert_eq!(agg.completed_count(ResourceKind::Visualization), 1);
        assert_eq!(agg.overall_state(ResourceKind::Visualization), AggregateState::Loaded);
        assert_eq!(agg.overall_state(ResourceKind::Count), AggregateState::Loaded);
    }

    #[test]
    fn retry_moves_a_failed_responder_back_to_requesting() {
        let agg = plain(2);
        let session = agg.start_query(&query()).unwrap();
        agg.record_response(session.id, id(1), ResourceKind::Count, ResponseOutcome::Failed("x".into()))
            .unwrap();
        agg.record_response(session.id, id(2), ResourceKind::Count, count(5)).unwrap();
        assert_eq!(agg.overall_state(ResourceKind::Count), AggregateState::Loaded);

        let summary = agg.retry_responder(session.id, id(1), ResourceKind::Count).unwrap();
        assert_eq!(summary.state, AggregateState::Loading);
    }

    #[test]
    fn session_operations_require_the_current_session() {
        let agg = plain(1);
        assert!(matches!(
            agg.start_resource(Uuid::new_v4(), ResourceKind::PatientList),
            Err(CohortError::NoActiveSession)
        ));

        agg.start_query(&query()).unwrap();
        assert!(matches!(
            agg.end_query(Uuid::new_v4()),
            Err(CohortError::StaleSession(_))
        ));
    }

    #[test]
    fn end_query_resets_every_responder() {
        let agg = plain(2);
        let session = agg.start_query(&query()).unwrap();
        agg.record_response(session.id, id(1), ResourceKind::Count, count(40)).unwrap();

        agg.end_query(session.id).unwrap();
        assert_eq!(agg.aggregate_count(), 0);
        assert!(agg
            .snapshot()
            .responders
            .iter()
            .all(|r| r.state == NetworkCohortState::default()));
    }

    #[test]
    fn concurrent_responses_are_all_applied() {
        let agg = Arc::new(plain(8));
        let session_id = agg.start_query(&query()).unwrap().id;

        let handles: Vec<_> = (1..=8)
            .map(|n| {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    agg.record_response(session_id, id(n), ResourceKind::Count, count(10))
                        .unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(agg.aggregate_count(), 80);
        assert_eq!(agg.overall_state(ResourceKind::Count), AggregateState::Loaded);
    }

    #[test]
    fn detail_views_skip_responders_whose_count_failed() {
        let agg = plain(2);
        let session = agg.start_query(&query()).unwrap();
        agg.record_response(session.id, id(1), ResourceKind::Count, count(50)).unwrap();
        agg.record_response(
            session.id,
            id(2),
            ResourceKind::Count,
            ResponseOutcome::Failed("timeout".into()),
        )
        .unwrap();

        let dispatched = agg.start_resource(session.id, ResourceKind::Visualization).unwrap();
        assert_eq!(dispatched, vec![id(1)]);

        agg.record_response(
            session.id,
            id(1),
            ResourceKind::Visualization,
            ResponseOutcome::Loaded(ResourcePayload::Visualization(serde_json::json!({}))),
        )
        .unwrap();

        let snapshot = agg.snapshot();
        assert_eq!(
            snapshot.responders[1].state.visualization.state_type(),
            CohortStateType::InError
        );
        assert_eq!(agg.overall_state(ResourceKind::Visualization), AggregateState::Loaded);
        assert!(agg.toggle_responder(id(2)).is_ok());
    }

    #[test]
    fn detail_views_wait_for_a_pending_count() {
        let agg = plain(2);
        let session = agg.start_query(&query()).unwrap();
        agg.record_response(session.id, id(1), ResourceKind::Count, count(50)).unwrap();

        let dispatched = agg.start_resource(session.id, ResourceKind::PatientList).unwrap();
        assert_eq!(dispatched, vec![id(1)]);

        agg.record_response(session.id, id(2), ResourceKind::Count, count(70)).unwrap();
        assert!(matches!(
            agg.retry_responder(session.id, id(2), ResourceKind::PatientList),
            Ok(AggregateSummary {
                state: AggregateState::Loading,
                ..
            })
        ));

        let recorded = agg
            .record_response(
                session.id,
                id(2),
                ResourceKind::PatientList,
                ResponseOutcome::Loaded(ResourcePayload::PatientList(vec![])),
            )
            .unwrap();
        assert!(matches!(recorded, Recorded::Applied { .. }));
    }

    #[test]
    fn retrying_a_detail_view_requires_a_loaded_count() {
        let agg = plain(2);
        let session = agg.start_query(&query()).unwrap();

        assert!(matches!(
            agg.retry_responder(session.id, id(2), ResourceKind::Visualization),
            Err(CohortError::CountNotLoaded(_))
        ));
    }

    #[test]
    fn note_search_goes_to_every_enabled_responder() {
        let agg = plain(2);
        let session = agg.start_query(&query()).unwrap();

        let dispatched = agg.start_resource(session.id, ResourceKind::NoteSearch).unwrap();
        assert_eq!(dispatched, vec![id(1), id(2)]);
    }

    #[test]
    fn toggles_racing_new_queries_never_strand_a_responder() {
        for _ in 0..500 {
            let agg = Arc::new(plain(2));
            let toggler = {
                let agg = Arc::clone(&agg);
                std::thread::spawn(move || {
                    let _ = agg.toggle_responder(id(2));
                })
            };
            agg.start_query(&query()).unwrap();
            toggler.join().unwrap();

            for responder in agg.snapshot().responders {
                assert!(
                    responder.identity.enabled || !responder.state.any_requesting(),
                    "responder {} disabled while requesting",
                    responder.identity.id
                );
            }
        }
    }
}
