use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Resource;

/// Resources granted in place on one agent, per pod.
///
/// The resource manager does not see in-place increases, so the total is
/// stamped onto that agent's offers as their delta.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentLedger {
    pub agent_id: String,
    /// Keyed by task group id.
    pub grants: BTreeMap<String, Resource>,
}

impl AgentLedger {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            grants: BTreeMap::new(),
        }
    }

    pub fn commit(&mut self, task_group_id: &str, delta: Resource) {
        *self.grants.entry(task_group_id.to_string()).or_default() += delta;
    }

    /// Forgets a pod's grant, returning what it held.
    pub fn release(&mut self, task_group_id: &str) -> Option<Resource> {
        self.grants.remove(task_group_id)
    }

    pub fn total(&self) -> Resource {
        self.grants.values().copied().sum()
    }
}
