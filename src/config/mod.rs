use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub facebook: FacebookConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub backup_apps: Vec<BackupAppConfig>,
    #[serde(default)]
    pub system_users: Vec<SystemUserConfig>,
    #[serde(default)]
    pub intelligence: IntelligenceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the service that issues user JWTs.
    /// A random per-process secret is used when unset.
    #[serde(default)]
    pub jwt_secret: String,
    /// Secret the token vault key is derived from
    #[serde(default = "default_encryption_key")]
    pub encryption_key: String,
    /// Set when `jwt_secret` was generated rather than configured
    #[serde(skip)]
    pub jwt_secret_generated: bool,
}

impl AuthConfig {
    fn ensure_jwt_secret(&mut self) {
        if self.jwt_secret.trim().is_empty() {
            self.jwt_secret = uuid::Uuid::new_v4().to_string();
            self.jwt_secret_generated = true;
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        let mut auth = Self {
            jwt_secret: String::new(),
            encryption_key: default_encryption_key(),
            jwt_secret_generated: false,
        };
        auth.ensure_jwt_secret();
        auth
    }
}

fn default_encryption_key() -> String {
    "adpilot-development-key".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FacebookConfig {
    #[serde(default = "default_graph_url")]
    pub graph_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Primary app used with users' own OAuth tokens
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for FacebookConfig {
    fn default() -> Self {
        Self {
            graph_url: default_graph_url(),
            api_version: default_api_version(),
            app_id: None,
            app_secret: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_graph_url() -> String {
    "https://graph.facebook.com".to_string()
}

fn default_api_version() -> String {
    "v18.0".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Graph calls a user's own token may make per clock hour
    #[serde(default = "default_user_hourly_threshold")]
    pub user_hourly_threshold: i64,
    /// Minimum delay before a queued request is retried
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: i64,
    #[serde(default = "default_queue_poll_interval")]
    pub queue_poll_interval_secs: u64,
    /// Usage header percentage at which a credential is treated as throttled
    #[serde(default = "default_usage_throttle_pct")]
    pub usage_throttle_pct: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            user_hourly_threshold: default_user_hourly_threshold(),
            retry_delay_secs: default_retry_delay(),
            max_attempts: default_max_attempts(),
            queue_poll_interval_secs: default_queue_poll_interval(),
            usage_throttle_pct: default_usage_throttle_pct(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_user_hourly_threshold() -> i64 {
    180
}

fn default_retry_delay() -> i64 {
    300
}

fn default_max_attempts() -> i64 {
    5
}

fn default_queue_poll_interval() -> u64 {
    60
}

fn default_usage_throttle_pct() -> f64 {
    90.0
}

/// Backup Facebook app seeded into the database at startup
#[derive(Debug, Clone, Deserialize)]
pub struct BackupAppConfig {
    pub app_id: String,
    pub name: String,
    pub access_token: String,
    pub app_secret: Option<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_backup_hourly_limit")]
    pub hourly_limit: i64,
}

fn default_backup_hourly_limit() -> i64 {
    200
}

/// Business Manager system user whose token serves internal ad accounts
#[derive(Debug, Clone, Deserialize)]
pub struct SystemUserConfig {
    pub business_id: String,
    pub name: String,
    pub access_token: String,
    pub app_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntelligenceConfig {
    /// Pause between accounts in a backfill
    #[serde(default = "default_backfill_account_delay")]
    pub backfill_account_delay_ms: u64,
    #[serde(default = "default_max_backfill_days")]
    pub max_backfill_days: i64,
    #[serde(default = "default_backfill_days")]
    pub default_backfill_days: i64,
    #[serde(default = "default_pattern_lookback")]
    pub pattern_lookback_days: i64,
    #[serde(default = "default_min_pattern_samples")]
    pub min_pattern_samples: usize,
    #[serde(default = "default_collect_interval")]
    pub collect_interval_secs: u64,
    #[serde(default = "default_automation_interval")]
    pub automation_interval_secs: u64,
}

impl Default for IntelligenceConfig {
    fn default() -> Self {
        Self {
            backfill_account_delay_ms: default_backfill_account_delay(),
            max_backfill_days: default_max_backfill_days(),
            default_backfill_days: default_backfill_days(),
            pattern_lookback_days: default_pattern_lookback(),
            min_pattern_samples: default_min_pattern_samples(),
            collect_interval_secs: default_collect_interval(),
            automation_interval_secs: default_automation_interval(),
        }
    }
}

fn default_backfill_account_delay() -> u64 {
    2000
}

fn default_max_backfill_days() -> i64 {
    90
}

fn default_backfill_days() -> i64 {
    30
}

fn default_pattern_lookback() -> i64 {
    30
}

fn default_min_pattern_samples() -> usize {
    7
}

fn default_collect_interval() -> u64 {
    6 * 3600
}

fn default_automation_interval() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            Self::from_toml(&content)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).with_context(|| "Failed to parse configuration file")?;
        config.auth.ensure_jwt_secret();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        for app in &self.backup_apps {
            if app.hourly_limit <= 0 {
                anyhow::bail!(
                    "Backup app {} must have a positive hourly_limit, got {}",
                    app.app_id,
                    app.hourly_limit
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.facebook.api_version, "v18.0");
        assert_eq!(config.rate_limit.user_hourly_threshold, 180);
        assert!(config.rate_limit.enabled);
        assert!(config.backup_apps.is_empty());
        assert_eq!(config.intelligence.max_backfill_days, 90);
    }

    #[test]
    fn test_backup_apps_and_system_users() {
        let config = Config::from_toml(
            r#"
            [rate_limit]
            user_hourly_threshold = 50

            [[backup_apps]]
            app_id = "111"
            name = "Backup One"
            access_token = "tok-1"
            priority = 1

            [[backup_apps]]
            app_id = "222"
            name = "Backup Two"
            access_token = "tok-2"
            hourly_limit = 400

            [[system_users]]
            business_id = "9001"
            name = "Agency system user"
            access_token = "sys-tok"
            "#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.user_hourly_threshold, 50);
        assert_eq!(config.rate_limit.retry_delay_secs, 300);
        assert_eq!(config.backup_apps.len(), 2);
        assert_eq!(config.backup_apps[0].hourly_limit, 200);
        assert_eq!(config.backup_apps[1].hourly_limit, 400);
        assert_eq!(config.system_users[0].business_id, "9001");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load(Path::new("/nonexistent/adpilot.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_jwt_secret_is_generated_when_unset() {
        let config = Config::from_toml("").unwrap();
        assert!(config.auth.jwt_secret_generated);
        assert!(!config.auth.jwt_secret.is_empty());
        assert!(Config::default().auth.jwt_secret_generated);

        let config = Config::from_toml(
            r#"
            [auth]
            jwt_secret = "shared"
            "#,
        )
        .unwrap();
        assert_eq!(config.auth.jwt_secret, "shared");
        assert!(!config.auth.jwt_secret_generated);
    }

    #[test]
    fn test_backup_app_needs_positive_limit() {
        let err = Config::from_toml(
            r#"
            [[backup_apps]]
            app_id = "111"
            name = "Backup"
            access_token = "tok"
            hourly_limit = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("hourly_limit"));
    }
}
