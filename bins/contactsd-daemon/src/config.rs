use contactsd_api::{validate_account_path, AccountSummary, PresenceType};
use contactsd_core::config::{default_presence_order, CoreConfig, RetryPolicy};
use contactsd_core::device_presence::PresenceOrder;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub presence: PresenceConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default = "default_disconnect_grace_ms")]
    pub disconnect_grace_ms: u64,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "default_presence_order")]
    pub order: Vec<PresenceType>,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            order: default_presence_order(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl ApiConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind_addr
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("bind_addr {}", self.bind_addr)))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    pub path: String,
    pub uri: String,
    pub service_provider: String,
    #[serde(default)]
    pub service_provider_display_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub icon_path: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub presence: PresenceType,
    #[serde(default)]
    pub presence_message: String,
    #[serde(default)]
    pub contacts_to_avoid: Vec<String>,
}

impl AccountConfig {
    pub fn summary(&self) -> AccountSummary {
        AccountSummary {
            account_path: self.path.clone(),
            account_uri: self.uri.clone(),
            service_provider: self.service_provider.clone(),
            service_provider_display_name: self.service_provider_display_name.clone(),
            account_display_name: self.display_name.clone(),
            account_icon_path: self.icon_path.clone(),
            presence_state: self.presence,
            presence_message: self.presence_message.clone(),
            enabled: self.enabled,
        }
    }
}

fn default_bind_addr() -> String {
    "127.0.0.1:9180".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_disconnect_grace_ms() -> u64 {
    CoreConfig::default().disconnect_grace_ms
}

impl DaemonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        PresenceOrder::new(self.presence.order.clone())
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;
        self.api.socket_addr()?;
        let mut seen = HashSet::new();
        for account in self.accounts.iter() {
            validate_account_path(&account.path)
                .map_err(|err| ConfigError::Invalid(format!("account {}", err)))?;
            if !seen.insert(account.path.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "account {} listed twice",
                    account.path
                )));
            }
        }
        Ok(())
    }

    pub fn core_config(&self) -> CoreConfig {
        CoreConfig {
            cache_dir: self.data_dir.join("cache"),
            avatar_dir: self.data_dir.join("avatars"),
            presence_order: self.presence.order.clone(),
            feature_retry: self.retry.clone(),
            disconnect_grace_ms: self.disconnect_grace_ms,
            ..CoreConfig::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io")]
    Io,
    #[error("parse")]
    Parse,
    #[error("invalid {0}")]
    Invalid(String),
}

pub fn load_config(path: &Path) -> Result<DaemonConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let config: DaemonConfig = toml::from_str(&content).map_err(|_| ConfigError::Parse)?;
    config.validate()?;
    Ok(config)
}
