//! Administrative configuration store.
//!
//! Sources, ingestion rules, and security policies are owned by the
//! administration layer; this service reads a JSON snapshot at startup and
//! re-reads it on an explicit reload. A failed reload keeps the previous
//! good configuration.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::errors::ConfigError;
use crate::models::{DataSource, IngestionRule, SecurityPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestionConfig {
    #[serde(default)]
    pub sources: Vec<DataSource>,
    #[serde(default)]
    pub rules: Vec<IngestionRule>,
    #[serde(default, rename = "security_policies")]
    pub security_policies: Vec<SecurityPolicy>,
}

impl IngestionConfig {
    /// A rule referencing a missing or disabled source is a configuration
    /// error, caught here rather than at request time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for rule in self.rules.iter().filter(|r| r.enabled) {
            let source = self.sources.iter().find(|s| s.id == rule.source);
            match source {
                None => {
                    return Err(ConfigError::InvalidValue {
                        key: format!("rules.{}.source", rule.id),
                        reason: format!("references unknown data source '{}'", rule.source),
                    })
                }
                Some(s) if !s.enabled => {
                    return Err(ConfigError::InvalidValue {
                        key: format!("rules.{}.source", rule.id),
                        reason: format!("references disabled data source '{}'", rule.source),
                    })
                }
                Some(_) => {}
            }
        }
        let mut seen = std::collections::HashSet::new();
        for source in &self.sources {
            if !seen.insert(&source.id) {
                return Err(ConfigError::InvalidValue {
                    key: "sources".to_string(),
                    reason: format!("duplicate data source id '{}'", source.id),
                });
            }
        }
        Ok(())
    }
}

pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<IngestionConfig>>,
}

impl ConfigStore {
    /// Store with no backing file; enrichment runs with an empty config.
    pub fn empty() -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(IngestionConfig::default())),
        }
    }

    pub fn with_config(config: IngestionConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        })
    }

    pub async fn load(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let config = Self::read_file(&path).await?;
        info!(
            path = %path.display(),
            sources = config.sources.len(),
            rules = config.rules.len(),
            policies = config.security_policies.len(),
            "Ingestion configuration loaded"
        );
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(config)),
        })
    }

    async fn read_file(path: &PathBuf) -> Result<IngestionConfig, ConfigError> {
        let raw = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| ConfigError::LoadFailed {
                reason: format!("{}: {e}", path.display()),
            })?;
        let config: IngestionConfig =
            serde_json::from_str(&raw).map_err(|e| ConfigError::LoadFailed {
                reason: format!("{}: {e}", path.display()),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Snapshot of the current configuration.
    pub async fn snapshot(&self) -> Arc<IngestionConfig> {
        self.current.read().await.clone()
    }

    /// Re-read the backing file. On failure the previous configuration stays
    /// active and the error is returned to the caller.
    pub async fn reload(&self) -> Result<Arc<IngestionConfig>, ConfigError> {
        let Some(path) = &self.path else {
            return Err(ConfigError::LoadFailed {
                reason: "no ingestion configuration file configured".to_string(),
            });
        };
        match Self::read_file(path).await {
            Ok(config) => {
                let config = Arc::new(config);
                *self.current.write().await = config.clone();
                info!(path = %path.display(), "Ingestion configuration reloaded");
                Ok(config)
            }
            Err(err) => {
                warn!(error = %err, "Ingestion configuration reload failed, keeping previous");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthType, SourceType, Transform};

    fn source(id: &str, enabled: bool) -> DataSource {
        DataSource {
            id: id.to_string(),
            name: id.to_string(),
            source_type: SourceType::Api,
            url: "http://localhost:9/".to_string(),
            auth_type: AuthType::None,
            credentials: Default::default(),
            permissions: vec![],
            rate_limit: None,
            timeout_seconds: 5,
            enabled,
        }
    }

    fn rule(id: &str, source: &str) -> IngestionRule {
        IngestionRule {
            id: id.to_string(),
            name: id.to_string(),
            source: source.to_string(),
            target: "extra".to_string(),
            conditions: Default::default(),
            transform: Transform::default(),
            permissions: vec![],
            priority: 0,
            enabled: true,
        }
    }

    #[test]
    fn rule_with_unknown_source_is_a_config_error() {
        let config = IngestionConfig {
            sources: vec![source("a", true)],
            rules: vec![rule("r1", "missing")],
            security_policies: vec![],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rule_with_disabled_source_is_a_config_error() {
        let config = IngestionConfig {
            sources: vec![source("a", false)],
            rules: vec![rule("r1", "a")],
            security_policies: vec![],
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn duplicate_source_ids_rejected() {
        let config = IngestionConfig {
            sources: vec![source("a", true), source("a", true)],
            rules: vec![],
            security_policies: vec![],
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn reload_keeps_previous_config_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ingestion.json");
        let good = serde_json::to_string(&IngestionConfig {
            sources: vec![source("a", true)],
            rules: vec![rule("r1", "a")],
            security_policies: vec![],
        })
        .unwrap();
        tokio::fs::write(&path, &good).await.unwrap();

        let store = ConfigStore::load(&path).await.unwrap();
        assert_eq!(store.snapshot().await.sources.len(), 1);

        tokio::fs::write(&path, "{not json").await.unwrap();
        assert!(store.reload().await.is_err());
        assert_eq!(store.snapshot().await.sources.len(), 1);
    }
}
