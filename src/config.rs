use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::archiver::{Slot, Slots};
use crate::constants::ARCHIVAL_USER_AGENT;
use crate::pooling::{PoolOptions, RetryPolicy};
use crate::reduxer::ScreenshotConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
    #[error("failed to parse {name} as integer: {source}")]
    ParseInt {
        name: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("failed to parse {name} as boolean: {value}")]
    ParseBool { name: String, value: String },
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Read `LOG_FORMAT`. Logging starts before the rest of the
    /// configuration is loaded.
    #[must_use]
    pub fn from_env() -> Self {
        parse_log_format(&env_or_default("LOG_FORMAT", "pretty"))
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Pools
    pub pooling_size: usize,
    pub publish_pooling_size: usize,
    pub wayback_timeout: Duration,
    pub wayback_max_retries: u32,
    pub retry_backoff: Duration,
    pub retry_policy: RetryPolicy,

    // Slots
    pub slots: Slots,
    pub user_agent: String,
    pub wayback_endpoint: String,
    pub wayback_availability_endpoint: String,
    pub wayback_rate_limit_per_min: u32,
    pub archive_today_endpoint: String,
    pub archive_today_rate_limit_per_min: u32,
    pub ipfs_api_url: String,
    pub ipfs_gateway_url: String,
    pub telegraph_endpoint: String,
    pub telegraph_access_token: Option<String>,
    pub telegraph_author: String,

    // Artifact capture
    pub storage_dir: Option<PathBuf>,
    pub reduxer_timeout: Duration,
    pub screenshot_enabled: bool,
    pub chrome_path: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub s3_prefix: String,

    // Publish
    pub publish_max_delay: Duration,
    pub chat_webhook_url: Option<String>,
    pub github_token: Option<String>,
    pub github_repo: Option<String>,
    pub github_api_url: String,
    pub meili_endpoint: Option<String>,
    pub meili_api_key: Option<String>,
    pub meili_index: String,

    // Web Server
    pub web_enabled: bool,
    pub web_host: String,
    pub web_port: u16,
    /// How long `POST /wayback` waits for its job before answering.
    pub web_wait: Duration,

    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an environment variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let wayback_timeout = Duration::from_secs(parse_env_u64("WAYBACK_TIMEOUT_SECS", 300)?);
        let wayback_max_retries = parse_env_u32("WAYBACK_MAX_RETRIES", 2)?;
        // Every attempt plus the fallback, by default
        let default_wait = wayback_timeout.saturating_mul(wayback_max_retries.saturating_add(2));

        Ok(Self {
            // Pools
            pooling_size: parse_env_usize("POOLING_SIZE", 3)?,
            publish_pooling_size: parse_env_usize("PUBLISH_POOLING_SIZE", 2)?,
            wayback_timeout,
            wayback_max_retries,
            retry_backoff: Duration::from_millis(parse_env_u64("WAYBACK_RETRY_BACKOFF_MS", 1000)?),
            retry_policy: parse_retry_policy(&env_or_default("WAYBACK_RETRY_POLICY", "uniform"))?,

            // Slots
            slots: parse_slots()?,
            user_agent: env_or_default("WAYBACK_USER_AGENT", ARCHIVAL_USER_AGENT),
            wayback_endpoint: env_or_default("WAYBACK_ENDPOINT", "https://web.archive.org"),
            wayback_availability_endpoint: env_or_default(
                "WAYBACK_AVAILABILITY_ENDPOINT",
                "https://archive.org",
            ),
            wayback_rate_limit_per_min: parse_env_u32("WAYBACK_RATE_LIMIT_PER_MIN", 5)?,
            archive_today_endpoint: env_or_default(
                "ARCHIVE_TODAY_ENDPOINT",
                "https://archive.today",
            ),
            archive_today_rate_limit_per_min: parse_env_u32(
                "ARCHIVE_TODAY_RATE_LIMIT_PER_MIN",
                3,
            )?,
            ipfs_api_url: env_or_default("IPFS_API_URL", "http://127.0.0.1:5001"),
            ipfs_gateway_url: env_or_default("IPFS_GATEWAY_URL", "https://ipfs.io/ipfs/"),
            telegraph_endpoint: env_or_default("TELEGRAPH_ENDPOINT", "https://api.telegra.ph"),
            telegraph_access_token: optional_env("TELEGRAPH_ACCESS_TOKEN"),
            telegraph_author: env_or_default("TELEGRAPH_AUTHOR", "Wayback Archiver"),

            // Artifact capture
            storage_dir: optional_env("STORAGE_DIR").map(PathBuf::from),
            reduxer_timeout: Duration::from_secs(parse_env_u64("REDUXER_TIMEOUT_SECS", 120)?),
            screenshot_enabled: parse_env_bool("SCREENSHOT_ENABLED", false)?,
            chrome_path: optional_env("CHROME_PATH"),
            s3_bucket: optional_env("S3_BUCKET"),
            s3_region: env_or_default("S3_REGION", "us-east-1"),
            s3_endpoint: optional_env("S3_ENDPOINT"),
            s3_prefix: env_or_default("S3_PREFIX", "wayback/"),

            // Publish
            publish_max_delay: Duration::from_secs(parse_env_u64("PUBLISH_MAX_DELAY_SECS", 10)?),
            chat_webhook_url: optional_env("CHAT_WEBHOOK_URL"),
            github_token: optional_env("GITHUB_TOKEN"),
            github_repo: optional_env("GITHUB_REPO"),
            github_api_url: env_or_default("GITHUB_API_URL", "https://api.github.com"),
            meili_endpoint: optional_env("MEILI_ENDPOINT"),
            meili_api_key: optional_env("MEILI_API_KEY"),
            meili_index: env_or_default("MEILI_INDEX", "capsules"),

            // Web Server
            web_enabled: parse_env_bool("WEB_ENABLED", true)?,
            web_host: env_or_default("WEB_HOST", "0.0.0.0"),
            web_port: parse_env_u16("WEB_PORT", 8964)?,
            web_wait: Duration::from_secs(parse_env_u64(
                "WEB_WAIT_SECS",
                default_wait.as_secs(),
            )?),

            log_format: LogFormat::from_env(),
        })
    }

    /// Validate that the configuration is usable.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pooling_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "POOLING_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.publish_pooling_size == 0 {
            return Err(ConfigError::InvalidValue {
                name: "PUBLISH_POOLING_SIZE".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.wayback_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "WAYBACK_TIMEOUT_SECS".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.slots.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "WAYBACK_ENABLE_*".to_string(),
                message: "at least one slot must be enabled".to_string(),
            });
        }
        if let Some(repo) = &self.github_repo {
            if self.github_repo_parts().is_none() {
                return Err(ConfigError::InvalidValue {
                    name: "GITHUB_REPO".to_string(),
                    message: format!("must be 'owner/name', got '{repo}'"),
                });
            }
        }
        Ok(())
    }

    /// Configuration suitable for tests: every slot on, no sinks, no capture.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            pooling_size: 2,
            publish_pooling_size: 2,
            wayback_timeout: Duration::from_secs(5),
            wayback_max_retries: 1,
            retry_backoff: Duration::ZERO,
            retry_policy: RetryPolicy::Uniform,
            slots: Slot::ALL.into_iter().collect(),
            user_agent: ARCHIVAL_USER_AGENT.to_string(),
            wayback_endpoint: "http://127.0.0.1:9".to_string(),
            wayback_availability_endpoint: "http://127.0.0.1:9".to_string(),
            wayback_rate_limit_per_min: 600,
            archive_today_endpoint: "http://127.0.0.1:9".to_string(),
            archive_today_rate_limit_per_min: 600,
            ipfs_api_url: "http://127.0.0.1:9".to_string(),
            ipfs_gateway_url: "https://ipfs.io/ipfs/".to_string(),
            telegraph_endpoint: "http://127.0.0.1:9".to_string(),
            telegraph_access_token: None,
            telegraph_author: "Wayback Archiver".to_string(),
            storage_dir: None,
            reduxer_timeout: Duration::from_secs(5),
            screenshot_enabled: false,
            chrome_path: None,
            s3_bucket: None,
            s3_region: "us-east-1".to_string(),
            s3_endpoint: None,
            s3_prefix: "wayback/".to_string(),
            publish_max_delay: Duration::ZERO,
            chat_webhook_url: None,
            github_token: None,
            github_repo: None,
            github_api_url: "http://127.0.0.1:9".to_string(),
            meili_endpoint: None,
            meili_api_key: None,
            meili_index: "capsules".to_string(),
            web_enabled: false,
            web_host: "127.0.0.1".to_string(),
            web_port: 0,
            web_wait: Duration::from_secs(10),
            log_format: LogFormat::Pretty,
        }
    }

    /// Options of the pool that runs archive requests.
    #[must_use]
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions::new(self.pooling_size, self.wayback_timeout, self.wayback_max_retries)
            .with_backoff(self.retry_backoff)
            .with_retry_policy(self.retry_policy)
    }

    /// Options of the pool that runs publish jobs.
    #[must_use]
    pub fn publish_pool_options(&self) -> PoolOptions {
        PoolOptions::new(
            self.publish_pooling_size,
            self.wayback_timeout,
            self.wayback_max_retries,
        )
        .with_backoff(self.retry_backoff)
        .with_retry_policy(self.retry_policy)
    }

    #[must_use]
    pub fn screenshot_config(&self) -> ScreenshotConfig {
        ScreenshotConfig {
            enabled: self.screenshot_enabled,
            chrome_path: self.chrome_path.clone(),
            ..ScreenshotConfig::default()
        }
    }

    /// `GITHUB_REPO` split into owner and name.
    #[must_use]
    pub fn github_repo_parts(&self) -> Option<(&str, &str)> {
        let (owner, name) = self.github_repo.as_deref()?.split_once('/')?;
        if owner.is_empty() || name.is_empty() || name.contains('/') {
            return None;
        }
        Some((owner, name))
    }
}

fn optional_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn env_or_default(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_u16(name: &str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => val.parse().map_err(|e| ConfigError::ParseInt {
            name: name.to_string(),
            source: e,
        }),
        _ => Ok(default),
    }
}

fn parse_env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(val) if !val.is_empty() => match val.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::ParseBool {
                name: name.to_string(),
                value: val,
            }),
        },
        _ => Ok(default),
    }
}

fn parse_slots() -> Result<Slots, ConfigError> {
    let mut slots = Slots::new();
    for slot in Slot::ALL {
        let default = matches!(slot, Slot::Ia | Slot::Is);
        let name = format!("WAYBACK_ENABLE_{}", slot.id().to_uppercase());
        if parse_env_bool(&name, default)? {
            slots.insert(slot);
        }
    }
    Ok(slots)
}

fn parse_retry_policy(value: &str) -> Result<RetryPolicy, ConfigError> {
    RetryPolicy::parse(value).ok_or_else(|| ConfigError::InvalidValue {
        name: "WAYBACK_RETRY_POLICY".to_string(),
        message: format!("must be 'uniform' or 'skip-permanent', got '{value}'"),
    })
}

fn parse_log_format(value: &str) -> LogFormat {
    match value.to_lowercase().as_str() {
        "json" | "structured" => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn test_parse_retry_policy() {
        assert_eq!(parse_retry_policy("uniform").unwrap(), RetryPolicy::Uniform);
        assert_eq!(
            parse_retry_policy("SKIP-PERMANENT").unwrap(),
            RetryPolicy::SkipPermanent
        );
        assert!(parse_retry_policy("never").is_err());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_env_bool("NONEXISTENT_VAR", true).unwrap());
        assert!(!parse_env_bool("NONEXISTENT_VAR", false).unwrap());
    }

    #[test]
    #[serial]
    fn test_default_slots() {
        for slot in Slot::ALL {
            std::env::remove_var(format!("WAYBACK_ENABLE_{}", slot.id().to_uppercase()));
        }
        let slots = parse_slots().unwrap();
        assert_eq!(slots, [Slot::Ia, Slot::Is].into_iter().collect());
    }

    #[test]
    #[serial]
    fn test_slots_from_env() {
        std::env::set_var("WAYBACK_ENABLE_IA", "false");
        std::env::set_var("WAYBACK_ENABLE_PH", "yes");
        let slots = parse_slots();
        std::env::remove_var("WAYBACK_ENABLE_IA");
        std::env::remove_var("WAYBACK_ENABLE_PH");

        let slots = slots.unwrap();
        assert!(!slots.contains(&Slot::Ia));
        assert!(slots.contains(&Slot::Ph));
    }

    #[test]
    #[serial]
    fn test_pooling_size_from_env() {
        std::env::set_var("POOLING_SIZE", "7");
        let config = Config::from_env();
        std::env::remove_var("POOLING_SIZE");

        let config = config.unwrap();
        assert_eq!(config.pooling_size, 7);
        assert_eq!(config.pool_options().capacity, 7);
    }

    #[test]
    #[serial]
    fn test_web_wait_covers_every_attempt() {
        std::env::remove_var("WEB_WAIT_SECS");
        std::env::set_var("WAYBACK_TIMEOUT_SECS", "10");
        std::env::set_var("WAYBACK_MAX_RETRIES", "1");
        let config = Config::from_env();
        std::env::remove_var("WAYBACK_TIMEOUT_SECS");
        std::env::remove_var("WAYBACK_MAX_RETRIES");

        assert_eq!(config.unwrap().web_wait, Duration::from_secs(30));
    }

    #[test]
    #[serial]
    fn test_invalid_integer_rejected() {
        std::env::set_var("WAYBACK_MAX_RETRIES", "many");
        let config = Config::from_env();
        std::env::remove_var("WAYBACK_MAX_RETRIES");

        assert!(matches!(config, Err(ConfigError::ParseInt { .. })));
    }

    #[test]
    fn test_validate() {
        assert!(Config::for_testing().validate().is_ok());

        let config = Config {
            pooling_size: 0,
            ..Config::for_testing()
        };
        assert!(config.validate().is_err());

        let config = Config {
            slots: Slots::new(),
            ..Config::for_testing()
        };
        assert!(config.validate().is_err());

        let config = Config {
            github_repo: Some("just-a-name".to_string()),
            ..Config::for_testing()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_github_repo_parts() {
        let config = Config {
            github_repo: Some("wabarc/wayback".to_string()),
            ..Config::for_testing()
        };
        assert_eq!(config.github_repo_parts(), Some(("wabarc", "wayback")));
    }
}
