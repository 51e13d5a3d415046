use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

use crate::ai_provider::{AIConfig, AIProvider};
use crate::core::{EngineError, SchedulerSettings};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip)]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub default_provider: String,
    pub providers: HashMap<String, ProviderConfig>,
    /// Fixed RNG seed for reproducible selection and delays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub file: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            file: "circletube.db".to_string(),
        }
    }
}

/// Upper bound for every duration setting. Retry backoff doubles per attempt
/// on top of this, so larger values would overflow timestamp arithmetic.
const MAX_DURATION_SECS: i64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_backoff_secs: i64,
    pub max_processing_secs: i64,
    pub generator_timeout_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            max_concurrency: 4,
            batch_size: 200,
            max_attempts: 3,
            retry_backoff_secs: 60,
            max_processing_secs: 300,
            generator_timeout_secs: 60,
        }
    }
}

impl SchedulerConfig {
    pub fn settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: std::time::Duration::from_secs(self.poll_interval_secs),
            max_concurrency: self.max_concurrency,
            batch_size: self.batch_size,
            max_attempts: self.max_attempts,
            retry_backoff: chrono::Duration::seconds(self.retry_backoff_secs),
            max_processing: chrono::Duration::seconds(self.max_processing_secs),
            generator_timeout: std::time::Duration::from_secs(self.generator_timeout_secs),
        }
    }

    fn validate(&self) -> std::result::Result<(), EngineError> {
        let checks = [
            (self.poll_interval_secs == 0, "poll_interval_secs must be positive"),
            (self.max_concurrency == 0, "max_concurrency must be positive"),
            (self.batch_size == 0, "batch_size must be positive"),
            (self.max_attempts == 0, "max_attempts must be positive"),
            (self.retry_backoff_secs < 0, "retry_backoff_secs must not be negative"),
            (self.retry_backoff_secs > MAX_DURATION_SECS, "retry_backoff_secs must be at most a week"),
            (self.max_processing_secs <= 0, "max_processing_secs must be positive"),
            (self.max_processing_secs > MAX_DURATION_SECS, "max_processing_secs must be at most a week"),
            (self.poll_interval_secs > MAX_DURATION_SECS as u64, "poll_interval_secs must be at most a week"),
            (self.generator_timeout_secs == 0, "generator_timeout_secs must be positive"),
            (self.generator_timeout_secs > MAX_DURATION_SECS as u64, "generator_timeout_secs must be at most a week"),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, reason)) => Err(EngineError::InvalidConfiguration(reason.to_string())),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub default_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Config {
    pub fn new(data_dir: Option<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.unwrap_or_else(|| {
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("circletube")
        });

        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let config_path = data_dir.join("config.json");
        if config_path.exists() {
            let config_str =
                std::fs::read_to_string(&config_path).context("Failed to read config.json")?;

            if config_str.trim().is_empty() {
                warn!(path = %config_path.display(), "config file is empty, recreating defaults");
            } else {
                let mut config: Config =
                    serde_json::from_str(&config_str).context("Failed to parse config.json")?;
                config.data_dir = data_dir;
                config.fill_api_key_from_env();
                config.validate()?;
                return Ok(config);
            }
        }

        let config = Self::default_config(data_dir);
        config.save()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = self.data_dir.join("config.json");
        let json_str =
            serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(&config_path, json_str).context("Failed to write config.json")?;
        Ok(())
    }

    fn default_config(data_dir: PathBuf) -> Self {
        let mut providers = HashMap::new();

        providers.insert(
            "ollama".to_string(),
            ProviderConfig {
                default_model: "qwen2.5".to_string(),
                host: Some("http://localhost:11434".to_string()),
                api_key: None,
                temperature: Some(0.8),
                max_tokens: Some(512),
            },
        );

        providers.insert(
            "openai".to_string(),
            ProviderConfig {
                default_model: "gpt-4o-mini".to_string(),
                host: None,
                api_key: std::env::var("OPENAI_API_KEY").ok(),
                temperature: Some(0.8),
                max_tokens: Some(512),
            },
        );

        Config {
            data_dir,
            database: DatabaseConfig::default(),
            scheduler: SchedulerConfig::default(),
            default_provider: "ollama".to_string(),
            providers,
            seed: None,
        }
    }

    fn fill_api_key_from_env(&mut self) {
        if let Some(openai_config) = self.providers.get_mut("openai") {
            if openai_config.api_key.as_ref().map_or(true, |key| key.is_empty()) {
                openai_config.api_key = std::env::var("OPENAI_API_KEY").ok();
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        if !self.providers.contains_key(&self.default_provider) {
            return Err(EngineError::InvalidConfiguration(format!(
                "default provider {} has no entry in providers",
                self.default_provider
            ))
            .into());
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(&self.database.file)
    }

    pub fn get_provider(&self, provider_name: &str) -> Option<&ProviderConfig> {
        self.providers.get(provider_name)
    }

    pub fn get_ai_config(&self, provider: Option<String>, model: Option<String>) -> Result<AIConfig> {
        let provider_name = provider.as_deref().unwrap_or(&self.default_provider);
        let provider_config = self
            .get_provider(provider_name)
            .ok_or_else(|| anyhow::anyhow!("Unknown provider: {}", provider_name))?;

        let ai_provider: AIProvider = provider_name.parse()?;
        let model_name = model.unwrap_or_else(|| provider_config.default_model.clone());

        Ok(AIConfig {
            provider: ai_provider,
            model: model_name,
            api_key: provider_config.api_key.clone(),
            base_url: provider_config.host.clone(),
            max_tokens: provider_config.max_tokens,
            temperature: provider_config.temperature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_writes_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::new(Some(dir.path().to_path_buf())).unwrap();

        assert!(dir.path().join("config.json").exists());
        assert_eq!(config.default_provider, "ollama");
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.database_path(), dir.path().join("circletube.db"));
    }

    #[test]
    fn test_saved_changes_survive_reload() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new(Some(dir.path().to_path_buf())).unwrap();
        config.scheduler.max_concurrency = 9;
        config.seed = Some(42);
        config.save().unwrap();

        let reloaded = Config::new(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(reloaded.scheduler.max_concurrency, 9);
        assert_eq!(reloaded.seed, Some(42));
        assert_eq!(reloaded.scheduler.settings().retry_backoff, chrono::Duration::seconds(60));
    }

    #[test]
    fn test_partial_scheduler_section_uses_defaults() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{
                "scheduler": { "poll_interval_secs": 15 },
                "default_provider": "ollama",
                "providers": { "ollama": { "default_model": "llama3" } }
            }"#,
        )
        .unwrap();

        let config = Config::new(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.scheduler.poll_interval_secs, 15);
        assert_eq!(config.scheduler.batch_size, 200);
        let ai = config.get_ai_config(None, None).unwrap();
        assert_eq!(ai.model, "llama3");
        assert_eq!(ai.provider, AIProvider::Ollama);
    }

    #[test]
    fn test_oversized_backoff_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{
                "scheduler": { "retry_backoff_secs": 9223372036854775807 },
                "default_provider": "ollama",
                "providers": { "ollama": { "default_model": "llama3" } }
            }"#,
        )
        .unwrap();

        let err = Config::new(Some(dir.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("retry_backoff_secs"));

        let week = SchedulerConfig {
            retry_backoff_secs: MAX_DURATION_SECS,
            max_processing_secs: MAX_DURATION_SECS,
            ..SchedulerConfig::default()
        };
        assert!(week.validate().is_ok());
        assert_eq!(week.settings().max_processing, chrono::Duration::days(7));
    }

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{
                "scheduler": { "max_concurrency": 0 },
                "default_provider": "ollama",
                "providers": { "ollama": { "default_model": "llama3" } }
            }"#,
        )
        .unwrap();

        let err = Config::new(Some(dir.path().to_path_buf())).unwrap_err();
        assert!(err.to_string().contains("max_concurrency"));
    }
}
