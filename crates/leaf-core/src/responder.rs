//! Responder identities and the enable/disable guard.
//!
//! `enabled` is the only identity field that changes at runtime. The guard lives here rather
//! than in any client so every caller gets the same rules:
//! - the last enabled responder cannot be disabled;
//! - a responder with a request in flight cannot be toggled.

use crate::error::{CohortError, CohortResult, ToggleRejection};
use leaf_types::{HexColour, NonEmptyText, ResponderId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// Metadata describing one federation node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkIdentity {
    pub id: ResponderId,
    pub name: NonEmptyText,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    pub primary_colour: HexColour,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_patients: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

fn enabled_by_default() -> bool {
    true
}

/// Check whether `identity` may have its `enabled` flag flipped.
///
/// `enabled_count` is the number of currently enabled responders and `in_flight` says whether
/// any resource of this responder is `REQUESTING`.
pub fn validate_toggle(
    identity: &NetworkIdentity,
    enabled_count: usize,
    in_flight: bool,
) -> Result<(), ToggleRejection> {
    if identity.enabled && enabled_count <= 1 {
        return Err(ToggleRejection::LastEnabledResponder);
    }
    if in_flight {
        return Err(ToggleRejection::RequestInFlight);
    }
    Ok(())
}

/// The set of known responders.
///
/// Reads vastly outnumber toggles, and the last-enabled check needs a consistent view of all
/// responders, so the whole map sits behind one `RwLock`.
#[derive(Debug, Default)]
pub struct ResponderRegistry {
    responders: RwLock<BTreeMap<ResponderId, NetworkIdentity>>,
}

impl ResponderRegistry {
    pub fn new(identities: impl IntoIterator<Item = NetworkIdentity>) -> Self {
        let responders = identities.into_iter().map(|r| (r.id, r)).collect();
        Self {
            responders: RwLock::new(responders),
        }
    }

    /// All identities ordered by id.
    pub fn list(&self) -> Vec<NetworkIdentity> {
        self.read().values().cloned().collect()
    }

    pub fn get(&self, id: ResponderId) -> CohortResult<NetworkIdentity> {
        self.read()
            .get(&id)
            .cloned()
            .ok_or(CohortError::UnknownResponder(id))
    }

    pub fn is_enabled(&self, id: ResponderId) -> bool {
        self.read().get(&id).is_some_and(|r| r.enabled)
    }

    /// Ids of enabled responders, ordered.
    pub fn enabled_ids(&self) -> Vec<ResponderId> {
        self.read()
            .values()
            .filter(|r| r.enabled)
            .map(|r| r.id)
            .collect()
    }

    /// Flip `enabled` for `id` if the guard allows it, returning the updated identity.
    ///
    /// `in_flight` is consulted while the write lock is held so the check and the update see
    /// the same registry state.
    pub fn toggle(
        &self,
        id: ResponderId,
        in_flight: impl FnOnce() -> bool,
    ) -> CohortResult<NetworkIdentity> {
        let mut responders = self
            .responders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let enabled_count = responders.values().filter(|r| r.enabled).count();
        let identity = responders
            .get_mut(&id)
            .ok_or(CohortError::UnknownResponder(id))?;

        validate_toggle(identity, enabled_count, in_flight())?;
        identity.enabled = !identity.enabled;

        Ok(identity.clone())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<ResponderId, NetworkIdentity>> {
        self.responders
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
