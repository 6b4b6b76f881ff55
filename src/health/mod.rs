//! Aggregation of per-service probe results into one application verdict.

mod engine;

pub use engine::*;

use serde::ser::{Serialize, SerializeMap, Serializer};

use crate::probe::HealthState;

/// Per-service states in registry order.
///
/// Serializes as a JSON object whose keys keep that order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStates(Vec<(String, HealthState)>);

impl ServiceStates {
    pub fn new(states: Vec<(String, HealthState)>) -> Self {
        Self(states)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, HealthState)> {
        self.0.iter().map(|(name, state)| (name.as_str(), *state))
    }

    /// The aggregate verdict: UP iff every service is UP.
    pub fn aggregate(&self) -> HealthState {
        combine(self.0.iter().map(|(_, state)| *state))
    }
}

#[cfg(test)]
impl ServiceStates {
    pub fn get(&self, service: &str) -> Option<HealthState> {
        self.iter().find(|(name, _)| *name == service).map(|(_, state)| state)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl Serialize for ServiceStates {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, state) in &self.0 {
            map.serialize_entry(name, state)?;
        }
        map.end()
    }
}

/// AND-reduction over service states. No quorum, no weighting.
pub fn combine<I>(states: I) -> HealthState
where
    I: IntoIterator<Item = HealthState>,
{
    HealthState::from(states.into_iter().all(|state| state.is_up()))
}
