use std::{env, path::PathBuf, str::FromStr, time::Duration};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::ConfigurationError;

/// A source of string settings. Implementations are serializable so the
/// chosen source can be recorded alongside a run.
#[async_trait]
#[typetag::serde]
pub trait ConfigManagerType: Send + Sync {
    async fn keys(&self) -> Vec<String>;
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str);
    async fn del(&self, key: &str);
    fn clone_box(&self) -> Box<dyn ConfigManagerType>;
    fn debug_box(&self) -> String;
}

#[derive(Serialize, Deserialize)]
pub struct ConfigManager(pub Box<dyn ConfigManagerType>);

impl ConfigManager {
    /// Non-empty value for `key`, trimmed.
    pub async fn value(&self, key: &str) -> Option<String> {
        self.0.get(key).await.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    async fn string_or(&self, key: &str, default: &str) -> String {
        self.value(key).await.unwrap_or_else(|| default.to_string())
    }

    async fn parsed_or<T>(&self, key: &str, default: T) -> Result<T, ConfigurationError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.value(key).await {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigurationError::Setting {
                key: key.to_string(),
                message: format!("`{raw}`: {e}"),
            }),
        }
    }
}

impl Clone for ConfigManager {
    fn clone(&self) -> Self {
        ConfigManager(self.0.clone_box())
    }
}

impl std::fmt::Debug for ConfigManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.debug_box())
    }
}

/// Process environment, seeded from a `.env` file when one exists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvConfigManager {
    env_file: PathBuf,
}

impl EnvConfigManager {
    pub fn new(env_file: PathBuf) -> Box<Self> {
        if env_file.exists() {
            match dotenvy::from_path(&env_file) {
                Ok(()) => info!("Loaded .env from {}", env_file.display()),
                Err(e) => warn!("could not parse {}: {e}", env_file.display()),
            }
        }
        Box::new(Self { env_file })
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for EnvConfigManager {
    async fn keys(&self) -> Vec<String> {
        env::vars().map(|(k, _)| k).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    async fn set(&self, key: &str, value: &str) {
        // SAFETY: only called while wiring up the process, before workers read the environment.
        unsafe { env::set_var(key, value) };
    }

    async fn del(&self, key: &str) {
        // SAFETY: see `set`.
        unsafe { env::remove_var(key) };
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("EnvConfigManager({})", self.env_file.display())
    }
}

/// In-memory settings, used by tests and embedders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MapConfigManager {
    map: DashMap<String, String>,
}

impl MapConfigManager {
    pub fn new() -> Box<Self> {
        Box::default()
    }

    pub fn with<const N: usize>(pairs: [(&str, &str); N]) -> Box<Self> {
        let mgr = Self::new();
        for (k, v) in pairs {
            mgr.map.insert(k.to_string(), v.to_string());
        }
        mgr
    }
}

#[typetag::serde]
#[async_trait]
impl ConfigManagerType for MapConfigManager {
    async fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }

    async fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    async fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    async fn del(&self, key: &str) {
        self.map.remove(key);
    }

    fn clone_box(&self) -> Box<dyn ConfigManagerType> {
        Box::new(self.clone())
    }

    fn debug_box(&self) -> String {
        format!("MapConfigManager({} entries)", self.map.len())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    OpenAi,
    Ollama,
}

impl FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(LlmProvider::OpenAi),
            "ollama" => Ok(LlmProvider::Ollama),
            other => Err(format!("expected openai or ollama, got `{other}`")),
        }
    }
}

/// Typed view of everything the application reads from its configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub llm_provider: LlmProvider,
    pub openai_url: Option<String>,
    pub openai_key: Option<String>,
    pub openai_model: Option<String>,
    pub ollama_url: Option<String>,
    pub ollama_model: Option<String>,
    pub database_path: PathBuf,
    pub hop_limit: usize,
    pub request_timeout: Duration,
    pub fetch_timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_delay: Duration,
    pub sql_cache_ttl: Duration,
    pub specification_path: Option<PathBuf>,
    pub workflow_path: Option<PathBuf>,
}

impl Settings {
    pub async fn load(config: &ConfigManager) -> Result<Self, ConfigurationError> {
        let hop_limit: usize = config.parsed_or("HOP_LIMIT", 32).await?;
        if hop_limit == 0 {
            return Err(ConfigurationError::Setting { key: "HOP_LIMIT".into(), message: "must be at least 1".into() });
        }
        let retry_max_attempts: u32 = config.parsed_or("RETRY_MAX_ATTEMPTS", 3).await?;

        Ok(Self {
            llm_provider: config.parsed_or("LLM_PROVIDER", LlmProvider::OpenAi).await?,
            openai_url: config.value("OPENAI_URL").await,
            openai_key: config.value("OPENAI_KEY").await,
            openai_model: config.value("OPENAI_MODEL").await,
            ollama_url: config.value("OLLAMA_URL").await,
            ollama_model: config.value("OLLAMA_MODEL").await,
            database_path: PathBuf::from(config.string_or("DATABASE_PATH", "ruleflow.db").await),
            hop_limit,
            request_timeout: Duration::from_secs(config.parsed_or("REQUEST_TIMEOUT_SECS", 120).await?),
            fetch_timeout: Duration::from_secs(config.parsed_or("FETCH_TIMEOUT_SECS", 20).await?),
            retry_max_attempts: retry_max_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.parsed_or("RETRY_BASE_DELAY_MS", 250).await?),
            sql_cache_ttl: Duration::from_secs(config.parsed_or("SQL_CACHE_TTL_SECS", 600).await?),
            specification_path: config.value("SPECIFICATION_PATH").await.map(PathBuf::from),
            workflow_path: config.value("WORKFLOW_PATH").await.map(PathBuf::from),
        })
    }
}
