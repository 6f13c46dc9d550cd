// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The dispatch runtime never talks to lapin directly. It drives the broker
//! through the [`AmqpChannel`] trait and receives [`Delivery`] values carrying
//! their own acknowledgment capability. [`crate::channel::LapinChannel`] is the
//! production implementation; tests substitute mocks.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use lapin::{
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

/// Header carrying the declared-type identifier of a message payload.
pub const AMQP_HEADERS_TYPE: &str = "type";

/// Stream of inbound deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Broker operations used by the topology builder, consumer loops and publisher.
///
/// Consumers are always started with explicit acknowledgement (`no_ack = false`).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    /// Declares an exchange.
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue.
    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    /// Binds a queue to an exchange.
    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Starts consuming `queue`.
    ///
    /// # Parameters
    /// * `queue` - The queue to consume
    /// * `consumer_tag` - Tag identifying the consumer on the broker
    ///
    /// # Returns
    /// The stream of deliveries, ending when the broker closes the consumer
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Publishes one message.
    ///
    /// # Parameters
    /// * `exchange` - Target exchange
    /// * `routing_key` - Routing key of the message
    /// * `payload` - Message body
    /// * `properties` - Message properties, headers included
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;
}

/// Positive acknowledgement of a single delivery.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;
}

/// One inbound message.
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
    acker: Arc<dyn DeliveryAcker>,
    acked: AtomicBool,
}

impl Delivery {
    /// Creates a delivery that is not redelivered and not acked yet.
    ///
    /// # Parameters
    /// * `exchange` - Exchange the message was published to
    /// * `routing_key` - Routing key it was published with
    /// * `properties` - Message properties
    /// * `data` - Message body
    /// * `acker` - Acknowledges the message on the broker
    ///
    /// # Returns
    /// A new Delivery
    pub fn new(
        exchange: &str,
        routing_key: &str,
        properties: BasicProperties,
        data: Vec<u8>,
        acker: Arc<dyn DeliveryAcker>,
    ) -> Self {
        Delivery {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered: false,
            properties,
            data,
            acker,
            acked: AtomicBool::new(false),
        }
    }

    /// Marks whether the broker already delivered this message before.
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Message headers, empty when the delivery carried none.
    pub fn headers(&self) -> FieldTable {
        self.properties.headers().clone().unwrap_or_default()
    }

    /// Value of the `type` header when present and a string.
    pub fn msg_type(&self) -> Option<String> {
        self.properties
            .headers()
            .as_ref()
            .and_then(|headers| header_str(headers, AMQP_HEADERS_TYPE))
    }

    /// Acknowledges the delivery. Only the first call reaches the broker.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.acked.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.acker.ack().await
    }

    /// Whether `ack` was already called.
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("properties", &self.properties)
            .field("data_len", &self.data.len())
            .field("acked", &self.is_acked())
            .finish()
    }
}

/// Reads a string header. Short and long AMQP strings are both accepted.
pub fn header_str(headers: &FieldTable, key: &str) -> Option<String> {
    match headers.inner().get(key)? {
        AMQPValue::LongString(v) => String::from_utf8(v.as_bytes().to_vec()).ok(),
        AMQPValue::ShortString(v) => Some(v.as_str().to_owned()),
        _ => None,
    }
}

/// Reads an integer header regardless of its AMQP width.
pub fn header_i64(headers: &FieldTable, key: &str) -> Option<i64> {
    match headers.inner().get(key)? {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        _ => None,
    }
}
