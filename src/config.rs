use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::session::SessionConfig;
use crate::store::{ConversationStore, CredentialProvider, EnvCredentials, MemoryStore, NatsKvStore};
use crate::transport::{AuthHeader, Connector, WebSocketConnector};

/// Prefix for environment overrides, e.g. `LOQA_REALTIME_SESSION__VOICE=shimmer`
const ENV_PREFIX: &str = "LOQA_REALTIME";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
    /// How long closed or failed sessions stay queryable
    #[serde(default = "default_session_retention_secs")]
    pub session_retention_secs: u64,
}

fn default_session_retention_secs() -> u64 {
    3600
}

/// Where and how to reach the realtime model
#[derive(Debug, Deserialize)]
pub struct RealtimeConfig {
    /// WebSocket endpoint, including deployment/model query parameters
    pub url: String,
    #[serde(default)]
    pub auth: AuthHeader,
    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// Lifetime assumed for keys read from the environment
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

fn default_api_key_env() -> String {
    "LOQA_REALTIME_API_KEY".to_string()
}

fn default_token_ttl_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Nats,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub nats_url: String,
    pub bucket: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            nats_url: "nats://localhost:4222".to_string(),
            bucket: "conversations".to_string(),
        }
    }
}

impl Config {
    /// Load `path` (any format the config crate knows, extension optional)
    /// with `LOQA_REALTIME_*` environment overrides on top
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(Self::environment())
            .build()
            .with_context(|| format!("Failed to read config {}", path))?;

        Self::finish(settings)
    }

    /// Parse TOML text, still honouring environment overrides
    pub fn from_toml(text: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(text, config::FileFormat::Toml))
            .add_source(Self::environment())
            .build()?;

        Self::finish(settings)
    }

    fn environment() -> config::Environment {
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn finish(settings: config::Config) -> Result<Self> {
        let config: Config = settings
            .try_deserialize()
            .context("Invalid configuration")?;
        config
            .session
            .validate()
            .context("Invalid [session] configuration")?;
        Ok(config)
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(WebSocketConnector::new(&self.realtime.url, self.realtime.auth))
    }

    pub fn credentials(&self) -> Arc<dyn CredentialProvider> {
        Arc::new(EnvCredentials::new(
            &self.realtime.api_key_env,
            Duration::from_secs(self.realtime.token_ttl_secs),
        ))
    }

    /// Open the configured conversation store
    pub async fn open_store(&self) -> Result<Arc<dyn ConversationStore>> {
        match self.store.backend {
            StoreBackend::Memory => {
                info!("Using in-memory conversation store");
                Ok(Arc::new(MemoryStore::new()))
            }
            StoreBackend::Nats => {
                let store = NatsKvStore::connect(&self.store.nats_url, &self.store.bucket)
                    .await
                    .context("Failed to open NATS conversation store")?;
                Ok(Arc::new(store))
            }
        }
    }
}
