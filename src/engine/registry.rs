use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::bus::MessageBus;
use crate::types::agent::MAX_HEALTH_SCORE;
use crate::types::{
    AgentDescriptor, AgentId, AgentStatus, AliasTable, Capability, Envelope, HealthRecord,
    MessageKind,
};

/// Capability to the ids of agents offering it. Always rebuilt from scratch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingTable {
    routes: HashMap<Capability, BTreeSet<AgentId>>,
}

impl RoutingTable {
    fn build(agents: &HashMap<AgentId, AgentDescriptor>) -> Self {
        let mut routes: HashMap<Capability, BTreeSet<AgentId>> = HashMap::new();
        for agent in agents.values() {
            for capability in &agent.capabilities {
                routes
                    .entry(capability.clone())
                    .or_default()
                    .insert(agent.id.clone());
            }
        }
        Self { routes }
    }

    pub fn agents_for(&self, capability: &Capability) -> Option<&BTreeSet<AgentId>> {
        self.routes.get(capability)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &Capability> {
        self.routes.keys()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    agents: HashMap<AgentId, AgentDescriptor>,
    routing: RoutingTable,
    health_history: HashMap<AgentId, VecDeque<HealthRecord>>,
    pending_checks: HashSet<AgentId>,
}

impl RegistryState {
    fn rebuild_routing(&mut self) {
        self.routing = RoutingTable::build(&self.agents);
        log::debug!(
            "routing table rebuilt: {} capabilities across {} agents",
            self.routing.len(),
            self.agents.len()
        );
    }
}

/// Owns every known agent. Membership changes and the routing-table rebuild
/// happen under one write guard, so readers never see a stale table.
pub struct AgentRegistry {
    state: RwLock<RegistryState>,
    aliases: AliasTable,
    history_limit: usize,
}

impl AgentRegistry {
    pub fn new(aliases: AliasTable, history_limit: usize) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            aliases,
            history_limit: history_limit.max(1),
        }
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    /// Inserts or replaces the agent and resets it to active with full health.
    pub fn register(&self, mut descriptor: AgentDescriptor) {
        let now = Utc::now();
        descriptor.status = AgentStatus::Active;
        descriptor.health_score = MAX_HEALTH_SCORE;
        descriptor.last_seen = now;

        let mut state = self.state.write();
        if let Some(previous) = state.agents.get(&descriptor.id) {
            descriptor.registered_at = previous.registered_at;
            log::info!("re-registering agent {}", descriptor.id);
        } else {
            descriptor.registered_at = now;
            log::info!(
                "registered agent {} with capabilities [{}]",
                descriptor.id,
                descriptor
                    .capabilities
                    .iter()
                    .map(|c| c.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }

        state.agents.insert(descriptor.id.clone(), descriptor);
        state.rebuild_routing();
    }

    pub fn unregister(&self, id: &str) -> Option<AgentDescriptor> {
        let mut state = self.state.write();
        let removed = state.agents.remove(id);
        state.health_history.remove(id);
        state.pending_checks.remove(id);

        if removed.is_some() {
            state.rebuild_routing();
            log::info!("unregistered agent {}", id);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<AgentDescriptor> {
        self.state.read().agents.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().agents.contains_key(id)
    }

    pub fn agents(&self) -> Vec<AgentDescriptor> {
        let mut agents: Vec<_> = self.state.read().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents().into_iter().map(|a| a.id).collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn routing_table(&self) -> RoutingTable {
        self.state.read().routing.clone()
    }

    /// Candidates for `task_type`.
    ///
    /// With explicit ids, returns those that are registered and active, in the
    /// order given. Otherwise returns every agent offering the task type or one
    /// of its aliases, best `health × (1 − load/100)` first. Unhealthy agents
    /// are not filtered out here; their zero score ranks them last.
    pub fn find_suitable(
        &self,
        task_type: &Capability,
        explicit_ids: Option<&[AgentId]>,
    ) -> Vec<AgentDescriptor> {
        let state = self.state.read();

        if let Some(ids) = explicit_ids {
            let mut seen = HashSet::new();
            return ids
                .iter()
                .filter(|id| seen.insert(id.as_str()))
                .filter_map(|id| state.agents.get(id))
                .filter(|agent| agent.is_active())
                .cloned()
                .collect();
        }

        let mut candidate_ids: BTreeSet<&AgentId> = BTreeSet::new();
        let wanted = std::iter::once(task_type).chain(self.aliases.aliases_for(task_type));
        for capability in wanted {
            if let Some(ids) = state.routing.agents_for(capability) {
                candidate_ids.extend(ids.iter());
            }
        }

        let mut candidates: Vec<AgentDescriptor> = candidate_ids
            .into_iter()
            .filter_map(|id| state.agents.get(id))
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.routing_score()
                .total_cmp(&a.routing_score())
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates
    }

    /// Mutates one agent and appends the resulting snapshot to its bounded
    /// health history. Returns the updated descriptor.
    pub fn update_health<F>(&self, id: &str, update: F) -> Option<AgentDescriptor>
    where
        F: FnOnce(&mut AgentDescriptor),
    {
        let mut state = self.state.write();
        let state = &mut *state;

        let agent = state.agents.get_mut(id)?;
        update(agent);
        agent.health_score = agent.health_score.min(MAX_HEALTH_SCORE);
        let updated = agent.clone();

        let history = state.health_history.entry(updated.id.clone()).or_default();
        history.push_back(HealthRecord::snapshot(&updated));
        while history.len() > self.history_limit {
            history.pop_front();
        }

        Some(updated)
    }

    pub fn health_history(&self, id: &str) -> Vec<HealthRecord> {
        self.state
            .read()
            .health_history
            .get(id)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Marks a probe as in flight. False if the agent is unknown or already
    /// being probed.
    pub fn begin_health_check(&self, id: &str) -> bool {
        let mut state = self.state.write();
        if !state.agents.contains_key(id) {
            return false;
        }
        state.pending_checks.insert(id.to_string())
    }

    pub fn finish_health_check(&self, id: &str) {
        self.state.write().pending_checks.remove(id);
    }

    pub fn pending_health_checks(&self) -> usize {
        self.state.read().pending_checks.len()
    }
}

#[derive(Debug, Deserialize)]
struct RegisterPayload {
    agent: AgentDescriptor,
}

#[derive(Debug, Deserialize)]
struct UnregisterPayload {
    #[serde(rename = "agentId", alias = "agent_id")]
    agent_id: AgentId,
}

pub fn register_message(sender: &str, agent: &AgentDescriptor) -> Envelope {
    Envelope::new(MessageKind::AgentRegister, sender, json!({ "agent": agent }))
}

pub fn unregister_message(sender: &str, agent_id: &str) -> Envelope {
    Envelope::new(
        MessageKind::AgentUnregister,
        sender,
        json!({ "agentId": agent_id }),
    )
}

/// Applies `AGENT_REGISTER` / `AGENT_UNREGISTER` broadcasts to the registry.
pub fn spawn_membership_listener(registry: Arc<AgentRegistry>, bus: &MessageBus) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        while let Some(envelope) = receiver.recv().await {
            match envelope.kind {
                MessageKind::AgentRegister => {
                    match serde_json::from_value::<RegisterPayload>(envelope.payload) {
                        Ok(payload) => registry.register(payload.agent),
                        Err(e) => log::warn!(
                            "ignoring malformed AGENT_REGISTER from {}: {}",
                            envelope.sender,
                            e
                        ),
                    }
                }
                MessageKind::AgentUnregister => {
                    match serde_json::from_value::<UnregisterPayload>(envelope.payload) {
                        Ok(payload) => {
                            registry.unregister(&payload.agent_id);
                        }
                        Err(e) => log::warn!(
                            "ignoring malformed AGENT_UNREGISTER from {}: {}",
                            envelope.sender,
                            e
                        ),
                    }
                }
                _ => {}
            }
        }
    })
}
