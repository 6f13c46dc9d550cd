// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! Serialises payloads as JSON and publishes them with the `type` header the
//! dispatcher routes on. Also republishes failed deliveries to the delay
//! exchange of retryable subscriptions.

use crate::{
    errors::AmqpError,
    otel,
    params::SubscriptionParams,
    transport::{header_i64, AmqpChannel, Delivery, AMQP_HEADERS_TYPE},
};
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::{debug, error};
use uuid::Uuid;

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Header read by the delayed message exchange plugin, in milliseconds
pub const AMQP_HEADERS_DELAY: &str = "x-delay";
/// Number of times a message went through the delay exchange
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";

/// Extra header values attached to outbound messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u32),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> AMQPValue {
        match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::Uint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
        }
    }
}

/// Per-message publishing options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Declared-type identifier; defaults to the payload's type name.
    pub msg_type: Option<String>,
    /// Extra headers copied into the message
    pub headers: HashMap<String, HeaderValue>,
    /// Delay in milliseconds, honoured by delayed exchanges only.
    pub delay_ms: Option<i64>,
}

impl PublishOptions {
    /// Overrides the declared-type identifier.
    ///
    /// # Parameters
    /// * `msg_type` - Identifier written to the `type` header
    ///
    /// # Returns
    /// Self for method chaining
    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    /// Adds one header to the message.
    ///
    /// # Parameters
    /// * `key` - Header name
    /// * `value` - Header value
    ///
    /// # Returns
    /// Self for method chaining
    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Sets the `x-delay` header.
    ///
    /// # Parameters
    /// * `delay` - Delay in milliseconds
    ///
    /// # Returns
    /// Self for method chaining
    pub fn delay_ms(mut self, delay: i64) -> Self {
        self.delay_ms = Some(delay);
        self
    }
}

/// Publisher writing JSON messages through an [`AmqpChannel`].
pub struct RabbitMQPublisher {
    channel: Arc<dyn AmqpChannel>,
}

impl RabbitMQPublisher {
    /// Creates a publisher over the given channel.
    ///
    /// # Parameters
    /// * `channel` - Transport used to publish
    ///
    /// # Returns
    /// A shared publisher
    pub fn new(channel: Arc<dyn AmqpChannel>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { channel })
    }

    /// Publishes `payload` to the subscription's exchange with its routing key.
    ///
    /// The payload is serialised as JSON and the `type` header is set to
    /// `opts.msg_type`, or to the payload's type name when none is given.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context injected when telemetry is enabled
    /// * `params` - Subscription naming the exchange and routing key
    /// * `payload` - The message to serialise
    /// * `opts` - Type identifier, headers and delay
    ///
    /// # Returns
    /// Ok, or `SerializePayloadError`/`PublishingError`
    pub async fn publish<T>(
        &self,
        ctx: &Context,
        params: &SubscriptionParams,
        payload: &T,
        opts: PublishOptions,
    ) -> Result<(), AmqpError>
    where
        T: Serialize + ?Sized,
    {
        let data = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "error serializing payload");
            AmqpError::SerializePayloadError
        })?;

        let msg_type = opts
            .msg_type
            .unwrap_or_else(|| std::any::type_name::<T>().to_owned());

        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

        if params.enabled_telemetry {
            otel::inject_context(ctx, &mut btree);
        }

        for (key, value) in opts.headers {
            btree.insert(ShortString::from(key), value.into());
        }

        if let Some(delay) = opts.delay_ms {
            btree.insert(
                ShortString::from(AMQP_HEADERS_DELAY),
                AMQPValue::LongLongInt(delay),
            );
        }

        btree.insert(
            ShortString::from(AMQP_HEADERS_TYPE),
            AMQPValue::LongString(LongString::from(msg_type.clone())),
        );

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(msg_type))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree));

        self.channel
            .publish(&params.exchange_name, &params.routing_key, &data, properties)
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })
    }

    /// Sends `delivery` back through the subscription's delay exchange.
    ///
    /// Body and properties are kept; `x-delay` is set and `x-retry-count`
    /// incremented. The message is routed with
    /// [`SubscriptionParams::retry_routing_key`], so it only comes back to the
    /// subscription's own queue. The retry count is informational: nothing here
    /// stops retrying once it grows.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context injected when telemetry is enabled
    /// * `params` - Subscription the delivery was consumed from
    /// * `delivery` - The failed delivery
    /// * `delay_ms` - Delay before the message is routed back
    ///
    /// # Returns
    /// Ok, or `PublishingToDelayError` naming the delay exchange
    pub async fn republish_delayed(
        &self,
        ctx: &Context,
        params: &SubscriptionParams,
        delivery: &Delivery,
        delay_ms: i64,
    ) -> Result<(), AmqpError> {
        let headers = delivery.headers();
        let retries = header_i64(&headers, AMQP_HEADERS_RETRY_COUNT).unwrap_or_default();

        let mut btree = headers.inner().clone();

        if params.enabled_telemetry {
            otel::inject_context(ctx, &mut btree);
        }

        btree.insert(
            ShortString::from(AMQP_HEADERS_DELAY),
            AMQPValue::LongLongInt(delay_ms),
        );
        btree.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongLongInt(retries + 1),
        );

        let exchange = params.delayed_exchange();
        debug!(
            exchange = exchange,
            retries = retries + 1,
            "republishing message to delayed exchange"
        );

        self.channel
            .publish(
                &exchange,
                params.retry_routing_key(),
                &delivery.data,
                delivery.properties.clone().with_headers(FieldTable::from(btree)),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing to delayed exchange");
                AmqpError::PublishingToDelayError(exchange)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        exchange::ExchangeKind,
        transport::{header_str, MockAmqpChannel, MockDeliveryAcker},
    };
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct OrderCreated {
        id: u64,
    }

    fn params() -> SubscriptionParams {
        SubscriptionParams::new("orders", ExchangeKind::Direct, "orders", "created")
    }

    #[tokio::test]
    async fn should_publish_json_with_type_header() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|exchange, key, payload, props| {
                let headers = props.headers().clone().unwrap_or_default();
                exchange == "orders"
                    && key == "created"
                    && payload == br#"{"id":1}"#
                    && header_str(&headers, AMQP_HEADERS_TYPE).as_deref() == Some("OrderCreated")
                    && header_i64(&headers, AMQP_HEADERS_DELAY) == Some(250)
                    && props.content_type().as_ref().map(|c| c.as_str()) == Some(JSON_CONTENT_TYPE)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let publisher = RabbitMQPublisher::new(Arc::new(channel));
        let opts = PublishOptions::default().msg_type("OrderCreated").delay_ms(250);

        let res = publisher
            .publish(&Context::new(), &params(), &OrderCreated { id: 1 }, opts)
            .await;

        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn should_default_type_header_to_type_name() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|_, _, _, props| {
                let headers = props.headers().clone().unwrap_or_default();
                header_str(&headers, AMQP_HEADERS_TYPE).as_deref()
                    == Some(std::any::type_name::<OrderCreated>())
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let publisher = RabbitMQPublisher::new(Arc::new(channel));

        publisher
            .publish(&Context::new(), &params(), &OrderCreated { id: 1 }, PublishOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn should_map_transport_failure_to_publishing_error() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .returning(|_, _, _, _| Err(AmqpError::ChannelError));

        let publisher = RabbitMQPublisher::new(Arc::new(channel));
        let res = publisher
            .publish(&Context::new(), &params(), &OrderCreated { id: 1 }, PublishOptions::default())
            .await;

        assert_eq!(res, Err(AmqpError::PublishingError));
    }

    #[tokio::test]
    async fn should_republish_original_body_and_bump_retry_count() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|exchange, key, payload, props| {
                let headers = props.headers().clone().unwrap_or_default();
                exchange == "orders.delayed"
                    && key == "orders"
                    && payload == br#"{"id":9}"#
                    && header_str(&headers, AMQP_HEADERS_TYPE).as_deref() == Some("OrderCreated")
                    && header_i64(&headers, AMQP_HEADERS_DELAY) == Some(1000)
                    && header_i64(&headers, AMQP_HEADERS_RETRY_COUNT) == Some(3)
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let mut headers = BTreeMap::new();
        headers.insert(
            ShortString::from(AMQP_HEADERS_TYPE),
            AMQPValue::LongString(LongString::from("OrderCreated")),
        );
        headers.insert(ShortString::from(AMQP_HEADERS_RETRY_COUNT), AMQPValue::LongInt(2));

        let delivery = Delivery::new(
            "orders",
            "created",
            BasicProperties::default().with_headers(FieldTable::from(headers)),
            br#"{"id":9}"#.to_vec(),
            Arc::new(MockDeliveryAcker::new()),
        );

        let publisher = RabbitMQPublisher::new(Arc::new(channel));
        let res = publisher
            .republish_delayed(&Context::new(), &params(), &delivery, 1000)
            .await;

        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn should_republish_to_the_failed_queue_only() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .withf(|exchange, key, _, _| exchange == "events.delayed" && key == "billing")
            .times(1)
            .returning(|_, _, _, _| Ok(()));

        let params = SubscriptionParams::new("events", ExchangeKind::Fanout, "billing", "").retryable();
        let delivery = Delivery::new(
            "events",
            "",
            BasicProperties::default(),
            br#"{"id":1}"#.to_vec(),
            Arc::new(MockDeliveryAcker::new()),
        );

        let publisher = RabbitMQPublisher::new(Arc::new(channel));
        let res = publisher
            .republish_delayed(&Context::new(), &params, &delivery, 10)
            .await;

        assert!(res.is_ok());
    }
}
