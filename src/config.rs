use anyhow::{Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::core::worker::RetryPolicy;

pub const CONFIG_FILE_NAME: &str = "botfactory.toml";
pub const DATA_DIR_ENV: &str = "BOTFACTORY_DATA_DIR";
pub const OPENAI_KEY_ENV: &str = "BOTFACTORY_OPENAI_API_KEY";
pub const NOTIFIER_TOKEN_ENV: &str = "BOTFACTORY_NOTIFIER_TOKEN";
pub const ADMIN_TOKEN_ENV: &str = "BOTFACTORY_ADMIN_TOKEN";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub quota: QuotaSettings,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub notifier: NotifierSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Database file, relative paths resolve against the data directory.
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_cache_ttl_ms")]
    pub cache_ttl_ms: u64,
    #[serde(default = "default_verify_max_wait_ms")]
    pub verify_max_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorSettings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaSettings {
    #[serde(default = "default_token_limit")]
    pub default_limit: i64,
    #[serde(default = "default_warning_ratio")]
    pub warning_ratio: f64,
    #[serde(default = "default_max_workers")]
    pub max_workers_per_owner: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    #[serde(default = "default_api_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub admin_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSettings {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Upper bound on one completion request.
    #[serde(default = "default_llm_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NotifierSettings {
    #[serde(default)]
    pub bot_token: Option<String>,
}

fn default_database() -> String {
    "botfactory.db".to_string()
}
fn default_cache_ttl_ms() -> u64 {
    2_000
}
fn default_verify_max_wait_ms() -> u64 {
    1_500
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_secs() -> u64 {
    5
}
fn default_max_delay_secs() -> u64 {
    30
}
fn default_poll_timeout_secs() -> u32 {
    10
}
fn default_token_limit() -> i64 {
    500_000
}
fn default_warning_ratio() -> f64 {
    0.9
}
fn default_max_workers() -> usize {
    10
}
fn default_api_host() -> String {
    "127.0.0.1".to_string()
}
fn default_api_port() -> u16 {
    17900
}
fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    60
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            database: default_database(),
            cache_ttl_ms: default_cache_ttl_ms(),
            verify_max_wait_ms: default_verify_max_wait_ms(),
        }
    }
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
        }
    }
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            default_limit: default_token_limit(),
            warning_ratio: default_warning_ratio(),
            max_workers_per_owner: default_max_workers(),
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            admin_token: None,
        }
    }
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: None,
            request_timeout_secs: default_llm_timeout_secs(),
        }
    }
}

/// Root directory for the database and the settings file.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV)
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".botfactory")
}

impl Settings {
    /// Loads `path`, or `<data_dir>/botfactory.toml` when no path is given.
    /// A missing file yields defaults; environment secrets are applied on top.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => data_dir().join(CONFIG_FILE_NAME),
        };
        let mut settings = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            let parsed: Settings = toml::from_str(&content)?;
            info!("Loaded settings from {}", config_path.display());
            parsed
        } else {
            info!(
                "No {} found, using default settings.",
                config_path.display()
            );
            Settings::default()
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var(OPENAI_KEY_ENV)
            && !key.is_empty()
        {
            self.llm.api_key = Some(key);
        }
        if let Ok(token) = std::env::var(NOTIFIER_TOKEN_ENV)
            && !token.is_empty()
        {
            self.notifier.bot_token = Some(token);
        }
        if let Ok(token) = std::env::var(ADMIN_TOKEN_ENV)
            && !token.is_empty()
        {
            self.api.admin_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.supervisor.max_retries == 0 {
            bail!("supervisor.max_retries must be at least 1");
        }
        if self.supervisor.base_delay_secs > self.supervisor.max_delay_secs {
            bail!(
                "supervisor.base_delay_secs ({}) exceeds max_delay_secs ({})",
                self.supervisor.base_delay_secs,
                self.supervisor.max_delay_secs
            );
        }
        if !(self.quota.warning_ratio > 0.0 && self.quota.warning_ratio <= 1.0) {
            bail!(
                "quota.warning_ratio must be in (0, 1], got {}",
                self.quota.warning_ratio
            );
        }
        if self.quota.default_limit < 0 {
            bail!("quota.default_limit must not be negative");
        }
        if self.llm.request_timeout_secs == 0 {
            bail!("llm.request_timeout_secs must be at least 1");
        }
        if self.quota.max_workers_per_owner == 0 {
            bail!("quota.max_workers_per_owner must be at least 1");
        }
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        let db = Path::new(&self.storage.database);
        if db.is_absolute() {
            db.to_path_buf()
        } else {
            data_dir().join(db)
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.storage.cache_ttl_ms)
    }

    pub fn verify_max_wait(&self) -> Duration {
        Duration::from_millis(self.storage.verify_max_wait_ms)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.supervisor.max_retries,
            base_delay: Duration::from_secs(self.supervisor.base_delay_secs),
            max_delay: Duration::from_secs(self.supervisor.max_delay_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_supervisor_contract() {
        let settings = Settings::default();
        let policy = settings.retry_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.base_delay, Duration::from_secs(5));
        assert_eq!(policy.max_delay, Duration::from_secs(30));
        assert_eq!(settings.quota.default_limit, 500_000);
        assert!((settings.quota.warning_ratio - 0.9).abs() < f64::EPSILON);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let settings = Settings::from_toml_str(
            r#"
[supervisor]
max_retries = 3

[api]
port = 9000
"#,
        )
        .unwrap();
        assert_eq!(settings.supervisor.max_retries, 3);
        assert_eq!(settings.supervisor.max_delay_secs, 30);
        assert_eq!(settings.api.port, 9000);
        assert_eq!(settings.api.host, "127.0.0.1");
    }

    #[test]
    fn llm_timeout_defaults_and_rejects_zero() {
        assert_eq!(Settings::default().llm_timeout(), Duration::from_secs(60));
        let err = Settings::from_toml_str("[llm]\nrequest_timeout_secs = 0\n").unwrap_err();
        assert!(err.to_string().contains("request_timeout_secs"));
    }

    #[test]
    fn rejects_zero_retry_ceiling() {
        let err = Settings::from_toml_str("[supervisor]\nmax_retries = 0\n").unwrap_err();
        assert!(err.to_string().contains("max_retries"));
    }

    #[test]
    fn rejects_base_delay_above_max() {
        let err = Settings::from_toml_str("[supervisor]\nbase_delay_secs = 60\nmax_delay_secs = 30\n")
            .unwrap_err();
        assert!(err.to_string().contains("base_delay_secs"));
    }

    #[test]
    fn rejects_warning_ratio_out_of_range() {
        assert!(Settings::from_toml_str("[quota]\nwarning_ratio = 1.5\n").is_err());
        assert!(Settings::from_toml_str("[quota]\nwarning_ratio = 0.0\n").is_err());
    }

    #[test]
    fn absolute_database_path_is_kept() {
        let mut settings = Settings::default();
        settings.storage.database = "/var/lib/botfactory/fleet.db".to_string();
        assert_eq!(
            settings.database_path(),
            PathBuf::from("/var/lib/botfactory/fleet.db")
        );
    }

    #[tokio::test]
    async fn load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml")))
            .await
            .unwrap();
        assert_eq!(settings.supervisor.max_retries, 5);
    }

    #[tokio::test]
    async fn load_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, "[quota]\ndefault_limit = 1000\n").unwrap();
        let settings = Settings::load(Some(&path)).await.unwrap();
        assert_eq!(settings.quota.default_limit, 1000);
    }
}
