use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::engine::correlation::AgentCaller;
use crate::engine::registry::AgentRegistry;
use crate::error::{CoordinationError, Result};
use crate::types::agent::MAX_HEALTH_SCORE;
use crate::types::message::QUERY_STATUS;
use crate::types::{AgentId, AgentStatus, MessageKind, Priority, StatusReport};

const INACTIVE_PENALTY: u8 = 30;
const ERROR_PENALTY: u8 = 20;
const SLOW_PENALTY: u8 = 15;

#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub probe_timeout_ms: u64,
    pub failure_penalty: u8,
    pub slow_response_threshold_ms: f64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5_000,
            failure_penalty: 20,
            slow_response_threshold_ms: 5_000.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckReport {
    pub agent_id: AgentId,
    pub health_score: u8,
    pub status: AgentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Score derived from a status report, starting from full health.
pub fn score_status(report: &StatusReport, slow_threshold_ms: f64) -> u8 {
    let mut score = MAX_HEALTH_SCORE;
    if !report.is_active() {
        score = score.saturating_sub(INACTIVE_PENALTY);
    }
    if report.metrics.errors > 0 {
        score = score.saturating_sub(ERROR_PENALTY);
    }
    if report.metrics.average_response_time > slow_threshold_ms {
        score = score.saturating_sub(SLOW_PENALTY);
    }
    score
}

/// Clears the in-flight mark when the probe finishes or its future is dropped.
struct InFlightGuard<'a> {
    registry: &'a AgentRegistry,
    id: &'a str,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.registry.finish_health_check(self.id);
    }
}

pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    caller: Arc<dyn AgentCaller>,
    settings: HealthSettings,
}

impl HealthMonitor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        caller: Arc<dyn AgentCaller>,
        settings: HealthSettings,
    ) -> Self {
        Self {
            registry,
            caller,
            settings,
        }
    }

    /// Probes every registered agent concurrently. Agents whose previous probe
    /// is still in flight are skipped.
    pub async fn check_all(&self) -> Vec<HealthCheckReport> {
        let ids = self.registry.agent_ids();
        let checks = ids.iter().map(|id| self.check_agent(id));

        join_all(checks)
            .await
            .into_iter()
            .filter_map(|outcome| outcome.ok().flatten())
            .collect()
    }

    /// `Ok(None)` when a probe for this agent is already running.
    pub async fn check_agent(&self, id: &str) -> Result<Option<HealthCheckReport>> {
        if !self.registry.contains(id) {
            return Err(CoordinationError::UnknownAgent(id.to_string()));
        }
        if !self.registry.begin_health_check(id) {
            log::debug!("health probe for {} already in flight", id);
            return Ok(None);
        }

        let _guard = InFlightGuard {
            registry: &self.registry,
            id,
        };
        let probe = self.probe(id).await;
        Ok(self.apply(id, probe))
    }

    async fn probe(&self, id: &str) -> Result<StatusReport> {
        let response = self
            .caller
            .call_agent(
                id,
                MessageKind::Query,
                json!({ "query_type": QUERY_STATUS }),
                Priority::Normal,
                Duration::from_millis(self.settings.probe_timeout_ms),
            )
            .await?;

        serde_json::from_value::<StatusReport>(response.payload).map_err(|e| {
            CoordinationError::HealthCheck {
                agent_id: id.to_string(),
                reason: format!("malformed status report: {}", e),
            }
        })
    }

    fn apply(&self, id: &str, probe: Result<StatusReport>) -> Option<HealthCheckReport> {
        let penalty = i32::from(self.settings.failure_penalty);
        let slow_threshold = self.settings.slow_response_threshold_ms;

        let (updated, error) = match probe {
            Ok(report) => {
                let score = score_status(&report, slow_threshold);
                let updated = self.registry.update_health(id, |agent| {
                    agent.health_score = score;
                    agent.status = if score > 0 {
                        AgentStatus::Active
                    } else {
                        AgentStatus::Unhealthy
                    };
                    agent.performance_metrics.response_time = report.metrics.average_response_time;
                    if let Some(load) = report.metrics.load {
                        agent.performance_metrics.load = load.clamp(0.0, 100.0);
                    }
                    if let Some(queue_size) = report.metrics.queue_size {
                        agent.performance_metrics.queue_size = queue_size;
                    }
                    agent.last_seen = Utc::now();
                });
                (updated, None)
            }
            Err(e) => {
                let updated = self.registry.update_health(id, |agent| {
                    agent.adjust_health(-penalty);
                    if agent.health_score == 0 {
                        agent.status = AgentStatus::Unhealthy;
                    }
                });
                (updated, Some(e.to_string()))
            }
        };

        // Unregistered while the probe was in flight.
        let updated = updated?;

        match &error {
            Some(reason) if updated.status == AgentStatus::Unhealthy => log::warn!(
                "agent {} marked unhealthy (score {}): {}",
                id,
                updated.health_score,
                reason
            ),
            Some(reason) => log::warn!(
                "health probe for {} failed, score now {}: {}",
                id,
                updated.health_score,
                reason
            ),
            None => log::debug!("agent {} health {}", id, updated.health_score),
        }

        Some(HealthCheckReport {
            agent_id: updated.id,
            health_score: updated.health_score,
            status: updated.status,
            error,
        })
    }

    /// Runs `check_all` every `interval` until the handle is aborted.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let reports = self.check_all().await;
                log::debug!("health sweep probed {} agents", reports.len());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AgentDescriptor, AliasTable, Capability, Envelope};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashMap;

    /// Replies to status queries with canned payloads; agents without one time out.
    #[derive(Default)]
    struct StatusCaller {
        replies: Mutex<HashMap<String, Value>>,
        delay: Option<Duration>,
    }

    #[async_trait]
    impl AgentCaller for StatusCaller {
        async fn call_agent(
            &self,
            target: &str,
            kind: MessageKind,
            payload: Value,
            _priority: Priority,
            timeout: Duration,
        ) -> Result<Envelope> {
            assert_eq!(kind, MessageKind::Query);
            assert_eq!(payload["query_type"], "status");
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self.replies.lock().get(target).cloned();
            match reply {
                Some(p) => Ok(Envelope::new(MessageKind::Response, target, p)),
                None => Err(CoordinationError::Timeout {
                    agent_id: target.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }),
            }
        }
    }

    fn setup(caller: StatusCaller, ids: &[&str]) -> (Arc<AgentRegistry>, HealthMonitor) {
        let registry = Arc::new(AgentRegistry::new(AliasTable::builtin().unwrap(), 10));
        for id in ids {
            registry.register(AgentDescriptor::new(
                *id,
                [Capability::new("analysis").unwrap()],
            ));
        }
        let monitor = HealthMonitor::new(
            registry.clone(),
            Arc::new(caller),
            HealthSettings::default(),
        );
        (registry, monitor)
    }

    fn status(status: &str, errors: u64, avg: f64) -> StatusReport {
        serde_json::from_value(json!({
            "status": status,
            "metrics": {"errors": errors, "average_response_time": avg}
        }))
        .unwrap()
    }

    #[test]
    fn test_score_status() {
        assert_eq!(score_status(&status("active", 0, 100.0), 5000.0), 100);
        assert_eq!(score_status(&status("busy", 0, 100.0), 5000.0), 70);
        assert_eq!(score_status(&status("active", 3, 100.0), 5000.0), 80);
        assert_eq!(score_status(&status("active", 0, 9000.0), 5000.0), 85);
        assert_eq!(score_status(&status("down", 1, 9000.0), 5000.0), 35);
    }

    #[tokio::test]
    async fn test_five_failed_probes_drive_score_to_zero() {
        let (registry, monitor) = setup(StatusCaller::default(), &["silent"]);

        let mut scores = Vec::new();
        for _ in 0..5 {
            let report = monitor.check_agent("silent").await.unwrap().unwrap();
            assert!(report.error.is_some());
            scores.push(report.health_score);
        }

        assert_eq!(scores, vec![80, 60, 40, 20, 0]);
        let agent = registry.get("silent").unwrap();
        assert_eq!(agent.health_score, 0);
        assert_eq!(agent.status, AgentStatus::Unhealthy);
        assert!(registry.contains("silent"));
        assert_eq!(registry.health_history("silent").len(), 5);

        // Further failures stay clamped.
        let report = monitor.check_agent("silent").await.unwrap().unwrap();
        assert_eq!(report.health_score, 0);
    }

    #[tokio::test]
    async fn test_successful_probe_recomputes_and_restores() {
        let caller = StatusCaller::default();
        caller.replies.lock().insert(
            "worker".into(),
            json!({"status": "active", "metrics": {"errors": 2, "average_response_time": 120.0, "load": 55.0, "queue_size": 4}}),
        );
        let (registry, monitor) = setup(caller, &["worker"]);
        registry.update_health("worker", |a| {
            a.health_score = 0;
            a.status = AgentStatus::Unhealthy;
        });

        let report = monitor.check_agent("worker").await.unwrap().unwrap();
        assert_eq!(report.health_score, 80);
        assert_eq!(report.status, AgentStatus::Active);
        assert!(report.error.is_none());

        let agent = registry.get("worker").unwrap();
        assert_eq!(agent.performance_metrics.load, 55.0);
        assert_eq!(agent.performance_metrics.queue_size, 4);
        assert_eq!(agent.performance_metrics.response_time, 120.0);
    }

    #[tokio::test]
    async fn test_check_all_covers_every_agent() {
        let caller = StatusCaller::default();
        caller
            .replies
            .lock()
            .insert("up".into(), json!({"status": "active", "metrics": {}}));
        let (registry, monitor) = setup(caller, &["up", "down"]);

        let mut reports = monitor.check_all().await;
        reports.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].agent_id, "down");
        assert_eq!(reports[0].health_score, 80);
        assert_eq!(reports[1].health_score, 100);
        assert_eq!(registry.pending_health_checks(), 0);
    }

    #[tokio::test]
    async fn test_overlapping_probe_is_skipped() {
        let caller = StatusCaller {
            delay: Some(Duration::from_millis(50)),
            ..Default::default()
        };
        let (registry, monitor) = setup(caller, &["slow"]);
        let monitor = Arc::new(monitor);

        let m = monitor.clone();
        let first = tokio::spawn(async move { m.check_agent("slow").await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(monitor.check_agent("slow").await.unwrap().is_none());
        assert!(first.await.unwrap().unwrap().is_some());
        assert_eq!(registry.get("slow").unwrap().health_score, 80);
    }

    #[tokio::test]
    async fn test_cancelled_probe_does_not_block_later_probes() {
        let caller = StatusCaller {
            delay: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let (registry, monitor) = setup(caller, &["a"]);

        let cancelled =
            tokio::time::timeout(Duration::from_millis(10), monitor.check_agent("a")).await;
        assert!(cancelled.is_err());
        assert_eq!(registry.pending_health_checks(), 0);

        let report = monitor.check_agent("a").await.unwrap();
        assert_eq!(report.unwrap().health_score, 80);
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let (_, monitor) = setup(StatusCaller::default(), &[]);
        assert!(matches!(
            monitor.check_agent("ghost").await,
            Err(CoordinationError::UnknownAgent(_))
        ));
    }
}
