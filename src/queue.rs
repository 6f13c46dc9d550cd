// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Builders for queue declarations and queue-to-exchange bindings.

use lapin::types::{AMQPValue, FieldTable, LongInt, ShortString};
use std::collections::BTreeMap;

/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
}

impl QueueDefinition {
    /// Creates a non-durable, non-exclusive queue definition.
    ///
    /// # Parameters
    /// * `name` - The name of the queue
    ///
    /// # Returns
    /// A new QueueDefinition with default settings
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    /// Name of the queue.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the queue survives broker restarts.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists instead of creating it.
    ///
    /// The declaration fails when the queue is missing.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Sends the declaration without waiting for the broker's confirmation.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Message Time-To-Live in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Declaration arguments derived from the optional limits.
    ///
    /// # Returns
    /// A table holding `x-message-ttl`, `x-max-length` and `x-max-length-bytes`
    /// for the limits that were set
    pub fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        let limits = [
            (AMQP_HEADERS_MESSAGE_TTL, self.ttl),
            (AMQP_HEADERS_MAX_LENGTH, self.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, self.max_length_bytes),
        ];

        for (key, value) in limits {
            if let Some(value) = value {
                args.insert(ShortString::from(key), AMQPValue::LongInt(LongInt::from(value)));
            }
        }

        FieldTable::from(args)
    }
}

/// Binding of a queue to an exchange through a routing key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a binding for `queue` with an empty exchange and routing key.
    ///
    /// # Parameters
    /// * `queue` - The name of the queue to bind
    ///
    /// # Returns
    /// A new QueueBinding
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            ..QueueBinding::default()
        }
    }

    /// Name of the bound queue.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Name of the exchange the queue is bound to.
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Routing key of the binding.
    pub fn key(&self) -> &str {
        &self.routing_key
    }

    /// Sets the exchange to bind to.
    ///
    /// # Parameters
    /// * `exchange` - The name of the exchange
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key of the binding.
    ///
    /// # Parameters
    /// * `key` - The routing key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_only_emit_configured_limits() {
        let args = QueueDefinition::new("orders").ttl(1000).max_length(10).arguments();

        assert_eq!(args.inner().len(), 2);
        assert_eq!(
            args.inner().get(AMQP_HEADERS_MESSAGE_TTL),
            Some(&AMQPValue::LongInt(1000))
        );
        assert!(args.inner().get(AMQP_HEADERS_MAX_LENGTH_BYTES).is_none());
    }
}
