use std::collections::HashSet;

use serde::Deserialize;
use thiserror::Error;

use crate::model::{EntityType, OsArch, OsType};

pub const DEFAULT_FORGE_URL: &str = "https://github.com";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load config file")]
    ConfigFile(#[from] config::ConfigError),

    #[error("duplicate credentials name: {0}")]
    DuplicateCredentials(String),

    #[error("duplicate entity: {0}")]
    DuplicateEntity(String),

    #[error("entity {0} references unknown credentials {1}")]
    UnknownCredentials(String, String),

    #[error("pool for {0} references unknown entity")]
    UnknownEntity(String),

    #[error("pool for {0} references unknown provider {1}")]
    UnknownProvider(String, String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    pub database: Database,
    #[serde(default)]
    pub log_file: Option<String>,
    /// Secret used to sign per-instance metadata tokens.
    pub jwt_secret: String,
    /// Prefer one-shot JIT runner configurations over registration tokens.
    #[serde(default = "default_true")]
    pub use_jit_config: bool,
    /// Externally reachable base URL; when set, each entity's webhook is
    /// registered with the forge at startup.
    #[serde(default)]
    pub webhook_base_url: Option<String>,
    #[serde(default)]
    pub credentials: Vec<CredentialsConfig>,
    #[serde(default)]
    pub entities: Vec<EntityConfig>,
    #[serde(default)]
    pub pools: Vec<PoolConfig>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Database {
    /// sqlx connection URL, e.g. `sqlite://fleet.db?mode=rwc`.
    pub url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct CredentialsConfig {
    pub name: String,
    pub token: String,
    #[serde(default = "default_forge_url")]
    pub forge_url: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct EntityConfig {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    #[serde(default)]
    pub owner: String,
    pub name: String,
    pub credentials: String,
    pub webhook_secret: String,
}

impl EntityConfig {
    pub fn slug(&self) -> String {
        match self.entity_type {
            EntityType::Repository => format!("{}/{}", self.owner, self.name),
            _ => self.name.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct PoolConfig {
    /// Entity slug this pool belongs to (`owner/name` for repositories).
    pub entity: String,
    pub provider: String,
    pub image: String,
    pub flavor: String,
    pub os_type: OsType,
    pub os_arch: OsArch,
    pub tags: Vec<String>,
    pub max_runners: u32,
    #[serde(default)]
    pub min_idle_runners: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_runner_timeout")]
    pub runner_timeout_minutes: u32,
    #[serde(default)]
    pub runner_group: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_runner_prefix")]
    pub runner_prefix: String,
    #[serde(default = "default_scale_down_factor")]
    pub scale_down_factor: f64,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderConfig {
    Openstack(OpenStackConfig),
}

impl ProviderConfig {
    pub fn name(&self) -> &str {
        match self {
            ProviderConfig::Openstack(cfg) => &cfg.name,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct OpenStackConfig {
    pub name: String,
    /// Cloud profile name in clouds.yaml.
    pub cloud: String,
    pub network: String,
    pub key_name: String,
    /// Only servers whose name carries this prefix are considered managed.
    #[serde(default = "default_runner_prefix")]
    pub server_prefix: String,
}

impl Config {
    pub fn load(name: &str) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(name))
            .build()?;

        let cfg = settings.try_deserialize::<Config>()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut creds = HashSet::new();
        for c in &self.credentials {
            if !creds.insert(c.name.as_str()) {
                return Err(ConfigError::DuplicateCredentials(c.name.clone()));
            }
        }

        let mut entities = HashSet::new();
        for e in &self.entities {
            if !entities.insert(e.slug()) {
                return Err(ConfigError::DuplicateEntity(e.slug()));
            }
            if !creds.contains(e.credentials.as_str()) {
                return Err(ConfigError::UnknownCredentials(
                    e.slug(),
                    e.credentials.clone(),
                ));
            }
        }

        let providers: HashSet<&str> = self.providers.iter().map(|p| p.name()).collect();
        for p in &self.pools {
            if !entities.contains(&p.entity) {
                return Err(ConfigError::UnknownEntity(p.entity.clone()));
            }
            if !providers.contains(p.provider.as_str()) {
                return Err(ConfigError::UnknownProvider(
                    p.entity.clone(),
                    p.provider.clone(),
                ));
            }
        }

        Ok(())
    }
}

fn default_bind_address() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_forge_url() -> String {
    DEFAULT_FORGE_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_runner_timeout() -> u32 {
    20
}

fn default_runner_prefix() -> String {
    "gha".to_string()
}

fn default_scale_down_factor() -> f64 {
    0.5
}
