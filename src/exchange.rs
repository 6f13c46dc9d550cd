// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Definitions
//!
//! Exchange kinds understood by the runtime and a builder for exchange
//! declarations. Delayed exchanges rely on the `x-delayed-message` broker
//! plugin and are what retryable subscriptions republish failed messages to.

use lapin::types::{AMQPValue, LongString, ShortString};
use serde::Deserialize;
use std::{collections::BTreeMap, fmt};

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Broker-side type name of the delayed message plugin exchange
pub const AMQP_DELAYED_EXCHANGE_KIND: &str = "x-delayed-message";
/// Suffix appended to an exchange name to name its delay exchange
pub const DELAYED_EXCHANGE_SUFFIX: &str = ".delayed";

/// Represents the types of exchanges available in RabbitMQ.
///
/// `Delay` is the plugin-provided delayed exchange; it routes like a direct
/// exchange once the per-message `x-delay` has elapsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    Delay,
}

impl ExchangeKind {
    /// Name of the kind as written in configuration and in `x-delayed-type`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
            ExchangeKind::Delay => "delay",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Delay => lapin::ExchangeKind::Custom(AMQP_DELAYED_EXCHANGE_KIND.to_owned()),
        }
    }
}

/// Name of the delay exchange paired with `exchange`.
///
/// # Parameters
/// * `exchange` - The name of the source exchange
///
/// # Returns
/// `<exchange>.delayed`
pub fn delayed_exchange_name(exchange: &str) -> String {
    format!("{exchange}{DELAYED_EXCHANGE_SUFFIX}")
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
}

impl ExchangeDefinition {
    /// Creates a non-durable direct exchange definition with the given name.
    ///
    /// # Parameters
    /// * `name` - The name of the exchange
    ///
    /// # Returns
    /// A new ExchangeDefinition with default settings
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
        }
    }

    /// Name of the exchange.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kind the exchange is declared with.
    pub fn exchange_kind(&self) -> ExchangeKind {
        self.kind
    }

    /// Whether the exchange survives broker restarts.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Arguments sent with the declaration.
    pub fn arguments(&self) -> &BTreeMap<ShortString, AMQPValue> {
        &self.params
    }

    /// Sets the exchange type.
    ///
    /// Choosing [`ExchangeKind::Delay`] this way routes as `direct`; use
    /// [`ExchangeDefinition::delayed`] to pick another routing behaviour.
    ///
    /// # Parameters
    /// * `kind` - The exchange type
    ///
    /// # Returns
    /// Self for method chaining
    pub fn kind(self, kind: ExchangeKind) -> Self {
        match kind {
            ExchangeKind::Delay => self.delayed(ExchangeKind::Direct),
            other => ExchangeDefinition { kind: other, ..self },
        }
    }

    /// Shorthand for `kind(ExchangeKind::Direct)`.
    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    /// Shorthand for `kind(ExchangeKind::Fanout)`.
    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Shorthand for `kind(ExchangeKind::Topic)`.
    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    /// Turns the exchange into a delayed exchange routing like `routing`.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    ///
    /// # Parameters
    /// * `routing` - Routing applied once the delay elapsed, written to `x-delayed-type`
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delayed(mut self, routing: ExchangeKind) -> Self {
        let routing = match routing {
            ExchangeKind::Delay => ExchangeKind::Direct,
            other => other,
        };

        self.kind = ExchangeKind::Delay;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(routing.as_str())),
        );
        self
    }

    /// Adds a single argument to the exchange declaration.
    ///
    /// # Parameters
    /// * `key` - The argument name
    /// * `value` - The argument value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn param(mut self, key: &str, value: AMQPValue) -> Self {
        self.params.insert(ShortString::from(key), value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Checks for existence without creating the exchange.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal: publishers cannot send to it directly,
    /// only other exchanges bound to it can.
    ///
    /// # Returns
    /// Self for method chaining
    pub fn internal(mut self) -> Self {
        self.internal = true;
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_configure_delayed_exchange() {
        let def = ExchangeDefinition::new("orders").durable().delayed(ExchangeKind::Topic);

        assert_eq!(def.exchange_kind(), ExchangeKind::Delay);
        assert_eq!(
            def.arguments().get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            Some(&AMQPValue::LongString(LongString::from("topic")))
        );
        assert!(matches!(
            lapin::ExchangeKind::from(def.exchange_kind()),
            lapin::ExchangeKind::Custom(ref k) if k == AMQP_DELAYED_EXCHANGE_KIND
        ));
    }

    #[test]
    fn should_default_delay_kind_to_direct_routing() {
        let def = ExchangeDefinition::new("orders").kind(ExchangeKind::Delay);

        assert_eq!(
            def.arguments().get(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            Some(&AMQPValue::LongString(LongString::from("direct")))
        );
        assert_eq!(delayed_exchange_name("orders"), "orders.delayed");
    }
}
