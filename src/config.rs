//! Configuration loader and validator for the publishing service.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub scheduler: Scheduler,
    pub build: Build,
    pub notifications: Notifications,
    #[serde(default)]
    pub webhook: Webhook,
    #[serde(default)]
    pub flags: BTreeMap<String, bool>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    /// Address the webhook server listens on.
    pub bind: String,
}

/// Scheduled publishing job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    /// Six-field cron expression (seconds first).
    pub cron: String,
    pub lock_ttl_seconds: u64,
    #[serde(default)]
    pub heartbeat_url: Option<String>,
}

/// External static-site build system.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Build {
    pub base_url: String,
    pub token: String,
}

/// Notification/email gateway.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Notifications {
    pub base_url: String,
    pub token: String,
    pub from: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Webhook {
    /// Shared secret expected in `x-webhook-secret`. Unset disables the check.
    #[serde(default)]
    pub secret: Option<String>,
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}/site-publisher.db",
                self.app.data_dir.trim_end_matches('/')
            )
        })
    }
}

/// Upper bound for the scheduled publishing lease (one day).
pub const MAX_LOCK_TTL_SECONDS: u64 = 86_400;

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.bind.parse::<std::net::SocketAddr>().is_err() {
        return Err(ConfigError::Invalid("app.bind must be a socket address"));
    }

    if cfg.scheduler.cron.split_whitespace().count() != 6 {
        return Err(ConfigError::Invalid(
            "scheduler.cron must have six fields (sec min hour dom mon dow)",
        ));
    }
    let ttl = cfg.scheduler.lock_ttl_seconds;
    if ttl == 0 || ttl > MAX_LOCK_TTL_SECONDS {
        return Err(ConfigError::Invalid(
            "scheduler.lock_ttl_seconds must be between 1 and 86400",
        ));
    }
    if let Some(url) = &cfg.scheduler.heartbeat_url {
        if reqwest::Url::parse(url).is_err() {
            return Err(ConfigError::Invalid("scheduler.heartbeat_url must be a URL"));
        }
    }

    if reqwest::Url::parse(&cfg.build.base_url).is_err() {
        return Err(ConfigError::Invalid("build.base_url must be a URL"));
    }
    if cfg.build.token.trim().is_empty() {
        return Err(ConfigError::Invalid("build.token must be non-empty"));
    }

    if reqwest::Url::parse(&cfg.notifications.base_url).is_err() {
        return Err(ConfigError::Invalid("notifications.base_url must be a URL"));
    }
    if cfg.notifications.token.trim().is_empty() {
        return Err(ConfigError::Invalid("notifications.token must be non-empty"));
    }
    if !cfg.notifications.from.contains('@') {
        return Err(ConfigError::Invalid(
            "notifications.from must be an email address",
        ));
    }

    if matches!(&cfg.webhook.secret, Some(s) if s.trim().is_empty()) {
        return Err(ConfigError::Invalid("webhook.secret must be non-empty when set"));
    }

    Ok(())
}

/// Returns a complete sample configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind: "0.0.0.0:8080"

scheduler:
  cron: "0 * * * * *"
  lock_ttl_seconds: 300
  heartbeat_url: "https://heartbeat.example.com/ping/scheduled-publishing"

build:
  base_url: "https://builds.example.com/"
  token: "YOUR_BUILD_API_TOKEN"

notifications:
  base_url: "https://mail.example.com/"
  token: "YOUR_MAIL_API_TOKEN"
  from: "publishing@example.com"

webhook:
  secret: "YOUR_WEBHOOK_SECRET"

flags:
  emails-for-scheduled-publishes: true
  emails-for-publishes: false
"#
}
