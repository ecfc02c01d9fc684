// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::rabbitmq::{Backoff, RabbitMQError, RetryPolicy};

/// Connection settings for one connectivity-layer instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    /// Heartbeat interval in seconds.
    pub heartbeat: u16,
    pub connection_pool_size: usize,
    pub retry_attempts: u32,
    /// Delay between retries in milliseconds.
    pub retry_delay: u64,
    pub ssl: bool,
    pub prefetch_count: u16,
    pub connect_timeout_ms: u64,
    pub confirm_mode: bool,
    pub dead_letter_exchange: String,
    pub health_check_queue: String,
    pub backoff: Backoff,
    pub max_retry_delay: u64,
}

// Default values
fn default_timeout() -> u64 { 5000 }
fn default_heartbeat() -> u16 { 60 }
fn default_prefetch_count() -> u16 { 10 }

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat: default_heartbeat(),
            connection_pool_size: 3,
            retry_attempts: 3,
            retry_delay: 1000,
            ssl: false,
            prefetch_count: default_prefetch_count(),
            connect_timeout_ms: default_timeout(),
            confirm_mode: true,
            dead_letter_exchange: "dlx".to_string(),
            health_check_queue: "health-check".to_string(),
            backoff: Backoff::Constant,
            max_retry_delay: 30_000,
        }
    }
}

impl BrokerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.heartbeat))
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            delay: self.retry_delay(),
            backoff: self.backoff,
            max_delay: Duration::from_millis(self.max_retry_delay.max(self.retry_delay)),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), RabbitMQError> {
        if self.host.trim().is_empty() {
            return Err(RabbitMQError::ConfigError("host cannot be empty".to_string()));
        }
        if self.connection_pool_size == 0 {
            return Err(RabbitMQError::ConfigError(
                "connectionPoolSize must be at least 1".to_string(),
            ));
        }
        if self.heartbeat == 0 {
            return Err(RabbitMQError::ConfigError(
                "heartbeat must be at least 1 second".to_string(),
            ));
        }
        if self.prefetch_count == 0 {
            return Err(RabbitMQError::ConfigError(
                "prefetchCount must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Broker address, credentials and vhost with heartbeat and connection timeout set.
    pub fn amqp_uri(&self) -> AMQPUri {
        AMQPUri {
            scheme: if self.ssl { AMQPScheme::AMQPS } else { AMQPScheme::AMQP },
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost: self.vhost.clone(),
            query: AMQPQueryString {
                heartbeat: Some(self.heartbeat),
                connection_timeout: Some(self.connect_timeout_ms),
                ..AMQPQueryString::default()
            },
        }
    }

    /// The broker URI with the password masked, for logs.
    pub fn redacted_uri(&self) -> String {
        let scheme = if self.ssl { "amqps" } else { "amqp" };
        let base = format!("{}://{}:{}", scheme, self.host, self.port);
        let mut url = match Url::parse(&base) {
            Ok(url) => url,
            Err(_) => return base,
        };

        let _ = url.set_username(&self.username);
        let _ = url.set_password(Some("***"));
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.clear().push(&self.vhost);
        }
        url.query_pairs_mut()
            .append_pair("heartbeat", &self.heartbeat.to_string())
            .append_pair("connection_timeout", &self.connect_timeout_ms.to_string());

        url.into()
    }
}

// Configuration loading and management functions
pub fn find_config_file() -> Result<PathBuf> {
    let locations = [
        ("Current directory", Path::new("broker-link.json")),
        ("Current directory (alternative)", Path::new("config/broker-link.json")),
    ];

    for (location_name, path) in locations.iter() {
        if path.exists() {
            debug!("Found config file in {}: {}", location_name, path.display());
            return Ok(path.to_path_buf());
        }
    }

    if let Some(home_dir) = home::home_dir() {
        let home_config = home_dir.join(".broker-link.json");
        if home_config.exists() {
            debug!("Found config file in home directory: {}", home_config.display());
            return Ok(home_config);
        }
    }

    Err(anyhow!(
        "Could not find broker-link.json in the current directory, config/, or the home directory"
    ))
}

pub fn load_config_from(path: &Path) -> Result<BrokerConfig> {
    let config_content = fs::read_to_string(path)
        .context(format!("Failed to read config file at {}", path.display()))?;

    let config: BrokerConfig = serde_json::from_str(&config_content)
        .context("Configuration file contains invalid JSON")?;

    Ok(config)
}

/// Defaults, then the config file if one is found, then environment overrides.
pub fn load() -> Result<BrokerConfig> {
    let mut config = match find_config_file() {
        Ok(path) => {
            info!("Loading broker configuration from {}", path.display());
            load_config_from(&path)?
        }
        Err(e) => {
            debug!("{}; using defaults", e);
            BrokerConfig::default()
        }
    };

    config.apply_env()?;
    config.validate()?;
    Ok(config)
}
