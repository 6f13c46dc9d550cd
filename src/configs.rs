// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Runtime Configuration
//!
//! Connection settings for the broker plus the few knobs the dispatch runtime
//! needs: the delay applied to retried messages and the size of the bounded
//! buffer between the transport and each consumer loop.

use serde::Deserialize;
use std::{env, str::FromStr};

/// Delay applied to retried messages when none is configured
pub const DEFAULT_RETRY_DELAY_MS: i64 = 10_000;
/// Deliveries buffered between the transport and a consumer loop
pub const DEFAULT_DELIVERY_BUFFER: usize = 64;

/// Connection and runtime settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    /// Connection name shown by the broker
    pub app_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    /// Delay, in milliseconds, before a retried message reappears on its queue.
    pub retry_delay_ms: i64,
    /// Capacity of the channel feeding each consumer loop.
    pub delivery_buffer: usize,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            app_name: "rabbitmq-dispatch".to_owned(),
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
            retry_delay_ms: DEFAULT_RETRY_DELAY_MS,
            delivery_buffer: DEFAULT_DELIVERY_BUFFER,
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the configuration from `RABBIT_*` environment variables.
    ///
    /// Missing or unparsable variables keep their default value.
    ///
    /// # Returns
    /// The configuration read from `APP_NAME`, `RABBIT_HOST`, `RABBIT_PORT`,
    /// `RABBIT_USER`, `RABBIT_PASSWORD`, `RABBIT_VHOST`, `RABBIT_RETRY_DELAY_MS`
    /// and `RABBIT_DELIVERY_BUFFER`
    pub fn from_env() -> Self {
        let defaults = RabbitMQConfigs::default();

        RabbitMQConfigs {
            app_name: env::var("APP_NAME").unwrap_or(defaults.app_name),
            host: env::var("RABBIT_HOST").unwrap_or(defaults.host),
            port: parse_var("RABBIT_PORT").unwrap_or(defaults.port),
            user: env::var("RABBIT_USER").unwrap_or(defaults.user),
            password: env::var("RABBIT_PASSWORD").unwrap_or(defaults.password),
            vhost: env::var("RABBIT_VHOST").unwrap_or(defaults.vhost),
            retry_delay_ms: parse_var("RABBIT_RETRY_DELAY_MS").unwrap_or(defaults.retry_delay_ms),
            delivery_buffer: parse_var("RABBIT_DELIVERY_BUFFER")
                .filter(|size| *size > 0)
                .unwrap_or(defaults.delivery_buffer),
        }
    }

    /// The `amqp://` URI used to open the connection.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.vhost
        )
    }
}

fn parse_var<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
