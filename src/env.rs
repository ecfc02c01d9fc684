use std::env;
use std::str::FromStr;

use dotenv::dotenv;

use crate::config::BrokerConfig;
use crate::rabbitmq::RabbitMQError;

impl BrokerConfig {
    /// Overrides fields from `RABBITMQ_*` variables (and a `.env` file, if present).
    pub fn apply_env(&mut self) -> Result<(), RabbitMQError> {
        dotenv().ok();
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Applies overrides from `lookup`; unset keys keep their current value.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), RabbitMQError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("RABBITMQ_HOST") {
            self.host = val;
        }
        if let Some(val) = lookup("RABBITMQ_USERNAME") {
            self.username = val;
        }
        if let Some(val) = lookup("RABBITMQ_PASSWORD") {
            self.password = val;
        }
        if let Some(val) = lookup("RABBITMQ_VHOST") {
            self.vhost = val;
        }
        parse_into(&lookup, "RABBITMQ_PORT", &mut self.port)?;
        parse_into(&lookup, "RABBITMQ_HEARTBEAT", &mut self.heartbeat)?;
        parse_into(&lookup, "RABBITMQ_POOL_SIZE", &mut self.connection_pool_size)?;
        parse_into(&lookup, "RABBITMQ_RETRY_ATTEMPTS", &mut self.retry_attempts)?;
        parse_into(&lookup, "RABBITMQ_RETRY_DELAY", &mut self.retry_delay)?;
        parse_into(&lookup, "RABBITMQ_SSL", &mut self.ssl)?;
        parse_into(&lookup, "RABBITMQ_PREFETCH_COUNT", &mut self.prefetch_count)?;
        parse_into(&lookup, "RABBITMQ_CONNECT_TIMEOUT_MS", &mut self.connect_timeout_ms)?;
        Ok(())
    }
}

fn parse_into<F, T>(lookup: &F, key: &str, target: &mut T) -> Result<(), RabbitMQError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(val) = lookup(key) {
        *target = val
            .trim()
            .parse()
            .map_err(|e| RabbitMQError::ConfigError(format!("{}={:?}: {}", key, val, e)))?;
    }
    Ok(())
}
