use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::{AgentId, AgentStatus, Capability};

pub const MAX_HEALTH_SCORE: u8 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceMetrics {
    /// Average response time in milliseconds.
    pub response_time: f64,
    /// Percentage, 0-100.
    pub success_rate: f64,
    /// Percentage, 0-100.
    pub load: f64,
    pub queue_size: u32,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            response_time: 0.0,
            success_rate: 100.0,
            load: 0.0,
            queue_size: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub capabilities: BTreeSet<Capability>,
    #[serde(default = "default_status")]
    pub status: AgentStatus,
    #[serde(default)]
    pub performance_metrics: PerformanceMetrics,
    #[serde(default = "default_health_score")]
    pub health_score: u8,
    #[serde(default = "Utc::now")]
    pub registered_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub last_seen: DateTime<Utc>,
}

fn default_status() -> AgentStatus {
    AgentStatus::Active
}

fn default_health_score() -> u8 {
    MAX_HEALTH_SCORE
}

impl AgentDescriptor {
    pub fn new(id: impl Into<AgentId>, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            capabilities: capabilities.into_iter().collect(),
            status: AgentStatus::Active,
            performance_metrics: PerformanceMetrics::default(),
            health_score: MAX_HEALTH_SCORE,
            registered_at: now,
            last_seen: now,
        }
    }

    pub fn with_metrics(mut self, metrics: PerformanceMetrics) -> Self {
        self.performance_metrics = metrics;
        self
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c.as_str() == capability)
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    /// Ranking used by suitability lookups: health discounted by current load.
    pub fn routing_score(&self) -> f64 {
        let load = self.performance_metrics.load.clamp(0.0, 100.0);
        f64::from(self.health_score) * (1.0 - load / 100.0)
    }

    /// Applies a signed delta to the health score, clamped to 0..=100.
    pub fn adjust_health(&mut self, delta: i32) {
        let next = (i32::from(self.health_score) + delta).clamp(0, i32::from(MAX_HEALTH_SCORE));
        self.health_score = next as u8;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub timestamp: DateTime<Utc>,
    pub health_score: u8,
    pub status: AgentStatus,
}

impl HealthRecord {
    pub fn snapshot(agent: &AgentDescriptor) -> Self {
        Self {
            timestamp: Utc::now(),
            health_score: agent.health_score,
            status: agent.status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(names: &[&str]) -> Vec<Capability> {
        names.iter().map(|n| Capability::new(n).unwrap()).collect()
    }

    #[test]
    fn test_new_agent_defaults() {
        let agent = AgentDescriptor::new("a", caps(&["translation"]));
        assert_eq!(agent.health_score, 100);
        assert_eq!(agent.status, AgentStatus::Active);
        assert!(agent.has_capability("translation"));
        assert!(!agent.has_capability("analysis"));
    }

    #[test]
    fn test_routing_score_discounts_load() {
        let mut agent = AgentDescriptor::new("a", caps(&["analysis"]));
        agent.performance_metrics.load = 50.0;
        assert_eq!(agent.routing_score(), 50.0);

        agent.health_score = 80;
        agent.performance_metrics.load = 0.0;
        assert_eq!(agent.routing_score(), 80.0);
    }

    #[test]
    fn test_adjust_health_clamps() {
        let mut agent = AgentDescriptor::new("a", caps(&["analysis"]));
        agent.adjust_health(25);
        assert_eq!(agent.health_score, 100);

        agent.adjust_health(-130);
        assert_eq!(agent.health_score, 0);
    }

    #[test]
    fn test_descriptor_deserializes_with_defaults() {
        let agent: AgentDescriptor =
            serde_json::from_str(r#"{"id": "worker-1", "capabilities": ["Translation", "analysis"]}"#)
                .unwrap();

        assert_eq!(agent.health_score, 100);
        assert_eq!(agent.status, AgentStatus::Active);
        assert!(agent.has_capability("translation"));
        assert_eq!(agent.performance_metrics.success_rate, 100.0);
    }
}
