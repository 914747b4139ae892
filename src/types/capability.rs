use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{CoordinationError, Result};

/// A normalized capability tag: lowercase ASCII alphanumerics plus `_`, `-` and `.`.
///
/// Task types use the same representation, so a task type and the capability
/// that satisfies it compare equal.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Capability(String);

impl Capability {
    pub const ORCHESTRATION: &'static str = "orchestration";

    pub fn new(raw: impl AsRef<str>) -> Result<Self> {
        let normalized = raw.as_ref().trim().to_ascii_lowercase();

        if normalized.is_empty() {
            return Err(CoordinationError::InvalidTaskType(
                "capability must not be empty".to_string(),
            ));
        }

        let valid = normalized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if !valid {
            return Err(CoordinationError::InvalidTaskType(format!(
                "'{}' contains characters outside [a-z0-9_.-]",
                raw.as_ref()
            )));
        }

        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Capability {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for Capability {
    type Error = CoordinationError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.0
    }
}

/// Task type to alternative capabilities that also satisfy it.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    aliases: HashMap<Capability, Vec<Capability>>,
}

impl AliasTable {
    pub fn new(raw: &HashMap<String, Vec<String>>) -> Result<Self> {
        let mut aliases = HashMap::with_capacity(raw.len());

        for (task_type, alternatives) in raw {
            let key = Capability::new(task_type).map_err(|e| {
                CoordinationError::InvalidConfig(format!("alias key '{}': {}", task_type, e))
            })?;

            let mut values = Vec::with_capacity(alternatives.len());
            for alternative in alternatives {
                let value = Capability::new(alternative).map_err(|e| {
                    CoordinationError::InvalidConfig(format!(
                        "alias '{}' of '{}': {}",
                        alternative, task_type, e
                    ))
                })?;
                if value == key {
                    return Err(CoordinationError::InvalidConfig(format!(
                        "task type '{}' lists itself as an alias",
                        key
                    )));
                }
                if !values.contains(&value) {
                    values.push(value);
                }
            }

            aliases.insert(key, values);
        }

        Ok(Self { aliases })
    }

    pub fn builtin() -> Result<Self> {
        Self::new(&Self::default_aliases())
    }

    pub fn default_aliases() -> HashMap<String, Vec<String>> {
        [
            ("translation", ["language_translation", "multilingual_support"]),
            ("analysis", ["data_analysis", "text_analysis"]),
            ("summarization", ["text_summarization", "content_analysis"]),
            ("code_review", ["code_analysis", "static_analysis"]),
            ("research", ["information_retrieval", "web_search"]),
        ]
        .into_iter()
        .map(|(task, alts)| {
            (
                task.to_string(),
                alts.iter().map(|a| a.to_string()).collect(),
            )
        })
        .collect()
    }

    pub fn aliases_for(&self, task_type: &Capability) -> &[Capability] {
        self.aliases
            .get(task_type)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_normalization() {
        let cap = Capability::new("  Language_Translation ").unwrap();
        assert_eq!(cap.as_str(), "language_translation");
    }

    #[test]
    fn test_capability_rejects_invalid() {
        assert!(Capability::new("").is_err());
        assert!(Capability::new("   ").is_err());
        assert!(Capability::new("has space").is_err());
        assert!(Capability::new("emoji✨").is_err());
    }

    #[test]
    fn test_builtin_aliases_are_valid() {
        let table = AliasTable::builtin().unwrap();
        let translation = Capability::new("translation").unwrap();

        let aliases: Vec<&str> = table
            .aliases_for(&translation)
            .iter()
            .map(|c| c.as_str())
            .collect();
        assert_eq!(aliases, vec!["language_translation", "multilingual_support"]);
    }

    #[test]
    fn test_alias_table_rejects_self_alias() {
        let mut raw = HashMap::new();
        raw.insert("analysis".to_string(), vec!["Analysis".to_string()]);

        let result = AliasTable::new(&raw);
        assert!(matches!(result, Err(CoordinationError::InvalidConfig(_))));
    }

    #[test]
    fn test_unknown_task_type_has_no_aliases() {
        let table = AliasTable::builtin().unwrap();
        let cap = Capability::new("painting").unwrap();
        assert!(table.aliases_for(&cap).is_empty());
    }
}
