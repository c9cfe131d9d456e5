// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Immutable settings handed explicitly to the connection bootstrap, the
//! topology manager and the dispatcher. Values come from defaults, the
//! environment, or any serde source.

use crate::{backoff::BackoffConfig, errors::AmqpError};
use serde::{Deserialize, Serialize};
use std::{env, str::FromStr, time::Duration};
use tracing::warn;
use url::Url;

/// Connection settings of the RabbitMQ server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpConfigs {
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for AmqpConfigs {
    fn default() -> Self {
        AmqpConfigs {
            app_name: "rabbitmq-redelivery".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
        }
    }
}

impl AmqpConfigs {
    /// Reads `APP_NAME`, `RABBITMQ_HOST`, `RABBITMQ_PORT`, `RABBITMQ_USER`,
    /// `RABBITMQ_PASSWORD` and `RABBITMQ_VHOST`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = AmqpConfigs::default();

        AmqpConfigs {
            app_name: env::var("APP_NAME").unwrap_or(defaults.app_name),
            host: env::var("RABBITMQ_HOST").unwrap_or(defaults.host),
            port: parse_env("RABBITMQ_PORT", defaults.port),
            user: env::var("RABBITMQ_USER").unwrap_or(defaults.user),
            password: env::var("RABBITMQ_PASSWORD").unwrap_or(defaults.password),
            vhost: env::var("RABBITMQ_VHOST").unwrap_or(defaults.vhost),
        }
    }

    /// Builds the AMQP URI. User, password and vhost are percent-encoded, so
    /// they may contain `@`, `:` or `/`.
    pub fn uri(&self) -> Result<String, AmqpError> {
        let invalid = || AmqpError::InvalidUriError(self.host.clone());

        let mut uri = Url::parse("amqp://localhost/").map_err(|_| invalid())?;
        uri.set_host(Some(&self.host)).map_err(|_| invalid())?;
        uri.set_port(Some(self.port)).map_err(|_| invalid())?;
        uri.set_username(&self.user).map_err(|_| invalid())?;
        uri.set_password(Some(&self.password)).map_err(|_| invalid())?;

        if !self.vhost.is_empty() {
            uri.path_segments_mut()
                .map_err(|_| invalid())?
                .clear()
                .push(&self.vhost);
        }

        Ok(uri.into())
    }
}

/// Per-subscription delivery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscriptionConfigs {
    /// TTL of the retry queue, i.e. the broker-side delay before redelivery.
    pub retry_delay: Duration,
    /// Unacknowledged deliveries the broker may push ahead of the handler.
    pub prefetch_count: u16,
    /// Upper bound on republishing a message to its retry queue.
    pub publish_timeout: Duration,
    /// Backoff used to re-issue the consume when the delivery stream ends.
    pub resubscribe: BackoffConfig,
}

impl Default for SubscriptionConfigs {
    fn default() -> Self {
        SubscriptionConfigs {
            retry_delay: Duration::from_millis(5000),
            prefetch_count: 1,
            publish_timeout: Duration::from_secs(5),
            resubscribe: BackoffConfig::default()
                .with_max_attempts(5)
                .with_initial_delay(Duration::from_millis(500))
                .with_max_delay(Duration::from_secs(30))
                .with_multiplier(2.0)
                .with_jitter(true),
        }
    }
}

impl SubscriptionConfigs {
    /// Reads `RABBITMQ_RETRY_DELAY_MS`, `RABBITMQ_PREFETCH` and
    /// `RABBITMQ_PUBLISH_TIMEOUT_MS`, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = SubscriptionConfigs::default();

        SubscriptionConfigs {
            retry_delay: Duration::from_millis(parse_env(
                "RABBITMQ_RETRY_DELAY_MS",
                defaults.retry_delay.as_millis() as u64,
            )),
            prefetch_count: parse_env("RABBITMQ_PREFETCH", defaults.prefetch_count),
            publish_timeout: Duration::from_millis(parse_env(
                "RABBITMQ_PUBLISH_TIMEOUT_MS",
                defaults.publish_timeout.as_millis() as u64,
            )),
            resubscribe: defaults.resubscribe,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    pub fn with_resubscribe(mut self, backoff: BackoffConfig) -> Self {
        self.resubscribe = backoff;
        self
    }
}

fn parse_env<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match env::var(key) {
        Err(_) => default,
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!(key, value = raw.as_str(), %default, "malformed env value, using default");
            default
        }),
    }
}
