use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::{ConfigError, CoreError, ReactionKind, EMBEDDING_DIM};

pub const DATABASE_URL_ENV: &str = "MEMEFEED_DATABASE_URL";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Weight of each reaction kind in the preference mean. Negative kinds pull a
/// user's preference away from the post.
pub const DEFAULT_REACTION_WEIGHTS: &[(ReactionKind, f64)] = &[
    (ReactionKind::Like, 1.0),
    (ReactionKind::Dislike, -1.0),
    (ReactionKind::Love, 2.0),
    (ReactionKind::Laugh, 1.5),
    (ReactionKind::Wow, 1.5),
    (ReactionKind::Sad, 0.3),
    (ReactionKind::Angry, -1.0),
    (ReactionKind::Insightful, 1.0),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    pub embedding_dimension: usize,
    pub reactions: ReactionsConfig,
    pub openai: OpenAiConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReactionsConfig {
    pub weights: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    pub model: String,
    pub base_url: String,
    pub timeout_seconds: u64,
    /// Only ever read from the environment.
    #[serde(skip)]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    pub backfill_interval_minutes: u64,
    pub backfill_batch_size: u32,
    /// Failed embedding attempts after which a post is no longer picked up.
    pub max_embedding_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://memefeed.db".to_string(),
            embedding_dimension: EMBEDDING_DIM,
            reactions: ReactionsConfig::default(),
            openai: OpenAiConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Default for ReactionsConfig {
    fn default() -> Self {
        Self {
            weights: DEFAULT_REACTION_WEIGHTS
                .iter()
                .map(|(kind, weight)| (kind.as_str().to_string(), *weight))
                .collect(),
        }
    }
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-3-small".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout_seconds: 30,
            api_key: None,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            backfill_interval_minutes: 10,
            backfill_batch_size: 50,
            max_embedding_attempts: 5,
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, CoreError> {
        let config: AppConfig = toml::from_str(raw).map_err(ConfigError::from)?;
        Ok(config)
    }

    /// Reads the TOML file at `path`, applies environment overrides and
    /// validates the result.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
            .into());
        }

        info!("Loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&raw)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Like [`AppConfig::load`], but falls back to defaults when the file does
    /// not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, CoreError> {
        if path.exists() {
            return Self::load(path);
        }

        debug!("No configuration at {}, using defaults", path.display());
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(DATABASE_URL_ENV) {
            self.database_url = url;
        }
        if let Some(key) = lookup(OPENAI_API_KEY_ENV).filter(|key| !key.is_empty()) {
            self.openai.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.embedding_dimension == 0 {
            return Err(ConfigError::InvalidValue {
                field: "embedding_dimension".to_string(),
                value: "0".to_string(),
            });
        }

        if let Some((kind, weight)) = self
            .reactions
            .weights
            .iter()
            .find(|(_, weight)| !weight.is_finite())
        {
            return Err(ConfigError::InvalidValue {
                field: format!("reactions.weights.{}", kind),
                value: weight.to_string(),
            });
        }

        if self.worker.queue_capacity == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "worker.queue_capacity must be greater than zero".to_string(),
            });
        }

        if self.worker.max_embedding_attempts == 0 {
            return Err(ConfigError::ValidationFailed {
                reason: "worker.max_embedding_attempts must be greater than zero".to_string(),
            });
        }

        Ok(())
    }

    pub fn openai_api_key(&self) -> Result<&str, ConfigError> {
        self.openai
            .api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvironmentVariable {
                var_name: OPENAI_API_KEY_ENV.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_reaction_table() {
        let config = AppConfig::default();
        assert_eq!(config.embedding_dimension, 1536);
        assert_eq!(config.reactions.weights.len(), 8);
        assert_eq!(config.reactions.weights["LOVE"], 2.0);
        assert_eq!(config.reactions.weights["DISLIKE"], -1.0);
        assert_eq!(config.reactions.weights["SAD"], 0.3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            database_url = "sqlite::memory:"

            [worker]
            queue_capacity = 8
            "#,
        )
        .unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.worker.queue_capacity, 8);
        assert_eq!(config.worker.backfill_interval_minutes, 10);
        assert_eq!(config.worker.max_embedding_attempts, 5);
        assert_eq!(config.openai.model, "text-embedding-3-small");
        assert_eq!(config.reactions.weights["LIKE"], 1.0);
    }

    #[test]
    fn test_weights_table_replaces_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
            [reactions.weights]
            LIKE = 1.0
            MEH = 0.0
            "#,
        )
        .unwrap();

        assert_eq!(config.reactions.weights.len(), 2);
        assert!(!config.reactions.weights.contains_key("LOVE"));
    }

    #[test]
    fn test_invalid_toml_is_a_parse_error() {
        let err = AppConfig::from_toml_str("database_url = [").unwrap_err();
        assert!(matches!(err, CoreError::Config(ConfigError::Parse(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            (DATABASE_URL_ENV, "sqlite://override.db"),
            (OPENAI_API_KEY_ENV, "sk-test"),
        ]
        .into_iter()
        .collect();

        let mut config = AppConfig::default();
        assert!(config.openai_api_key().is_err());

        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.database_url, "sqlite://override.db");
        assert_eq!(config.openai_api_key().unwrap(), "sk-test");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.embedding_dimension = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));

        let mut config = AppConfig::default();
        config
            .reactions
            .weights
            .insert("LIKE".to_string(), f64::NAN);
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.worker.queue_capacity = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));

        let mut config = AppConfig::default();
        config.worker.max_embedding_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let path = std::env::temp_dir().join(format!("memefeed_missing_{}.toml", uuid::Uuid::new_v4()));
        let err = AppConfig::load(&path).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Config(ConfigError::FileNotFound { .. })
        ));
        assert!(AppConfig::load_or_default(&path).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("memefeed_config_{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "embedding_dimension = 3\n").unwrap();

        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.embedding_dimension, 3);

        std::fs::remove_file(&path).ok();
    }
}
