// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Subscription Parameters
//!
//! This module defines the parameters identifying one consumption context.
//! They are used both to declare the topology a subscription needs and to
//! drive its consumer loop.

use crate::exchange::{delayed_exchange_name, ExchangeKind};
use serde::Deserialize;

/// Identifies one consumption context: where messages come from, which queue
/// they land in and how handler failures are treated.
///
/// Parameters are immutable once passed to
/// [`crate::RabbitMQMessaging::subscribe`]; the consumer loop keeps its own copy
/// for the lifetime of its task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriptionParams {
    /// Exchange the subscription's queue is bound to
    pub exchange_name: String,
    /// Routing behaviour of that exchange
    pub exchange_kind: ExchangeKind,
    /// Queue consumed by the subscription
    pub queue_name: String,
    /// Routing key binding the queue to the exchange
    pub routing_key: String,
    /// Republish failed messages through the delay exchange instead of dropping them.
    ///
    /// Retries are unbounded: a handler that always fails sees the message again
    /// after every delay. The `x-retry-count` header tells the handler how many
    /// times the message already went through the delay exchange, so it can
    /// decide to give up by returning `Ok`.
    pub retryable: bool,
    /// Extract trace context from deliveries and open a consumer span for each one
    pub enabled_telemetry: bool,
}

impl SubscriptionParams {
    /// Creates non-retryable parameters without telemetry.
    ///
    /// # Parameters
    /// * `exchange` - The name of the exchange
    /// * `kind` - The exchange type
    /// * `queue` - The name of the queue to consume
    /// * `routing_key` - The key binding the queue to the exchange
    ///
    /// # Returns
    /// New subscription parameters
    pub fn new(exchange: &str, kind: ExchangeKind, queue: &str, routing_key: &str) -> Self {
        SubscriptionParams {
            exchange_name: exchange.to_owned(),
            exchange_kind: kind,
            queue_name: queue.to_owned(),
            routing_key: routing_key.to_owned(),
            retryable: false,
            enabled_telemetry: false,
        }
    }

    /// Enables delay-exchange retries for failed handlers.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Enables OpenTelemetry context propagation and consumer spans.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn with_telemetry(mut self) -> Self {
        self.enabled_telemetry = true;
        self
    }

    /// Exchange that retried messages are republished to.
    ///
    /// Every subscription on the same exchange shares this delay exchange; it is
    /// always a direct one, so [`SubscriptionParams::retry_routing_key`] keeps
    /// each queue's retries apart.
    ///
    /// # Returns
    /// The delay exchange name, `<exchange>.delayed`
    pub fn delayed_exchange(&self) -> String {
        delayed_exchange_name(&self.exchange_name)
    }

    /// Routing key used to bind the queue to the delay exchange and to republish
    /// its failed messages.
    ///
    /// It is the queue name, which is unique per broker, so a retry only ever
    /// reaches the queue it failed on.
    ///
    /// # Returns
    /// The queue name
    pub fn retry_routing_key(&self) -> &str {
        &self.queue_name
    }
}
