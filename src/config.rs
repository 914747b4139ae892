use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::engine::balancer::DEFAULT_SPECIALIST_MIN_CAPABILITIES;
use crate::engine::coordinator::CoordinatorSettings;
use crate::engine::health::HealthSettings;
use crate::engine::workflow::TemplateCatalog;
use crate::error::{CoordinationError, Result};
use crate::types::{AliasTable, BackoffKind, RetryPolicy};

const ENV_PREFIX: &str = "CONDUCTOR_";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_port: u16,
    pub bus_capacity: usize,
    pub default_timeout_ms: u64,
    pub health_check_interval_ms: u64,
    pub health_probe_timeout_ms: u64,
    pub health_failure_penalty: u8,
    pub slow_response_threshold_ms: u64,
    pub health_history_limit: usize,
    pub optimizer_interval_ms: u64,
    pub coordination_log_limit: usize,
    pub workflow_history_limit: usize,
    pub specialist_min_capabilities: usize,
    pub default_max_retries: u32,
    pub default_backoff: BackoffKind,
    pub retry_base_delay_ms: u64,
    pub capability_aliases: HashMap<String, Vec<String>>,
    pub workflow_templates: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_port: 8080,
            bus_capacity: 1024,
            default_timeout_ms: 30_000,
            health_check_interval_ms: 30_000,
            health_probe_timeout_ms: 5_000,
            health_failure_penalty: 20,
            slow_response_threshold_ms: 5_000,
            health_history_limit: 50,
            optimizer_interval_ms: 60_000,
            coordination_log_limit: 100,
            workflow_history_limit: 100,
            specialist_min_capabilities: DEFAULT_SPECIALIST_MIN_CAPABILITIES,
            default_max_retries: 0,
            default_backoff: BackoffKind::Exponential,
            retry_base_delay_ms: 100,
            capability_aliases: AliasTable::default_aliases(),
            workflow_templates: None,
        }
    }
}

impl Config {
    /// Defaults overridden by `CONDUCTOR_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Ok(toml::from_str(&raw)?)
    }

    /// File (when given) then environment, validated.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));

        override_with(&mut self.api_port, "API_PORT", get("API_PORT"))?;
        override_with(&mut self.bus_capacity, "BUS_CAPACITY", get("BUS_CAPACITY"))?;
        override_with(
            &mut self.default_timeout_ms,
            "DEFAULT_TIMEOUT_MS",
            get("DEFAULT_TIMEOUT_MS"),
        )?;
        override_with(
            &mut self.health_check_interval_ms,
            "HEALTH_CHECK_INTERVAL_MS",
            get("HEALTH_CHECK_INTERVAL_MS"),
        )?;
        override_with(
            &mut self.health_probe_timeout_ms,
            "HEALTH_PROBE_TIMEOUT_MS",
            get("HEALTH_PROBE_TIMEOUT_MS"),
        )?;
        override_with(
            &mut self.health_failure_penalty,
            "HEALTH_FAILURE_PENALTY",
            get("HEALTH_FAILURE_PENALTY"),
        )?;
        override_with(
            &mut self.slow_response_threshold_ms,
            "SLOW_RESPONSE_THRESHOLD_MS",
            get("SLOW_RESPONSE_THRESHOLD_MS"),
        )?;
        override_with(
            &mut self.optimizer_interval_ms,
            "OPTIMIZER_INTERVAL_MS",
            get("OPTIMIZER_INTERVAL_MS"),
        )?;
        override_with(
            &mut self.specialist_min_capabilities,
            "SPECIALIST_MIN_CAPABILITIES",
            get("SPECIALIST_MIN_CAPABILITIES"),
        )?;
        override_with(
            &mut self.default_max_retries,
            "DEFAULT_MAX_RETRIES",
            get("DEFAULT_MAX_RETRIES"),
        )?;
        override_with(
            &mut self.retry_base_delay_ms,
            "RETRY_BASE_DELAY_MS",
            get("RETRY_BASE_DELAY_MS"),
        )?;

        if let Some(raw) = get("DEFAULT_BACKOFF") {
            self.default_backoff = parse_backoff(&raw)?;
        }
        if let Some(path) = get("WORKFLOW_TEMPLATES") {
            self.workflow_templates = Some(PathBuf::from(path));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let non_zero = [
            ("bus_capacity", self.bus_capacity as u64),
            ("default_timeout_ms", self.default_timeout_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("health_probe_timeout_ms", self.health_probe_timeout_ms),
            ("optimizer_interval_ms", self.optimizer_interval_ms),
            ("health_history_limit", self.health_history_limit as u64),
            ("coordination_log_limit", self.coordination_log_limit as u64),
            ("workflow_history_limit", self.workflow_history_limit as u64),
            (
                "specialist_min_capabilities",
                self.specialist_min_capabilities as u64,
            ),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(CoordinationError::InvalidConfig(format!(
                "{} must be greater than zero",
                name
            )));
        }

        if !(1..=100).contains(&self.health_failure_penalty) {
            return Err(CoordinationError::InvalidConfig(format!(
                "health_failure_penalty must be within 1..=100, got {}",
                self.health_failure_penalty
            )));
        }

        self.alias_table()?;
        Ok(())
    }

    pub fn alias_table(&self) -> Result<AliasTable> {
        AliasTable::new(&self.capability_aliases)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.default_max_retries,
            backoff: self.default_backoff,
            base_delay_ms: self.retry_base_delay_ms,
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            default_timeout_ms: self.default_timeout_ms,
            default_retry_policy: self.retry_policy(),
            log_limit: self.coordination_log_limit,
        }
    }

    pub fn health_settings(&self) -> HealthSettings {
        HealthSettings {
            probe_timeout_ms: self.health_probe_timeout_ms,
            failure_penalty: self.health_failure_penalty,
            slow_response_threshold_ms: self.slow_response_threshold_ms as f64,
        }
    }

    /// Built-in templates plus the configured template file, if any.
    pub fn template_catalog(&self) -> Result<TemplateCatalog> {
        let mut catalog = TemplateCatalog::builtin()?;
        if let Some(path) = &self.workflow_templates {
            catalog.load_file(path)?;
        }
        Ok(catalog)
    }
}

fn override_with<T: FromStr>(target: &mut T, name: &str, raw: Option<String>) -> Result<()> {
    if let Some(raw) = raw {
        *target = raw.trim().parse().map_err(|_| {
            CoordinationError::InvalidConfig(format!(
                "{}{} has an invalid value '{}'",
                ENV_PREFIX, name, raw
            ))
        })?;
    }
    Ok(())
}

fn parse_backoff(raw: &str) -> Result<BackoffKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "fixed" => Ok(BackoffKind::Fixed),
        "linear" => Ok(BackoffKind::Linear),
        "exponential" => Ok(BackoffKind::Exponential),
        other => Err(CoordinationError::InvalidConfig(format!(
            "unknown backoff '{}'",
            other
        ))),
    }
}
