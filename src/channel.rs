// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! Opens the lapin connection and channel, and adapts them to the
//! [`AmqpChannel`] transport trait the rest of the crate is written against.

use crate::{
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition},
    transport::{AmqpChannel, Delivery, DeliveryAcker, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::Arc;
use tracing::{debug, error};

/// Creates a new AMQP connection and channel from `cfg`.
///
/// The connection is named after `cfg.app_name` so it can be told apart in the
/// broker's management UI.
///
/// # Parameters
/// * `cfg` - Host, credentials and application name
///
/// # Returns
/// The connection and channel, or `ConnectionError`/`ChannelError`
pub async fn new_amqp_channel(
    cfg: &RabbitMQConfigs,
) -> Result<(Arc<Connection>, Arc<Channel>), AmqpError> {
    debug!("creating amqp connection...");
    let options = ConnectionProperties::default()
        .with_connection_name(LongString::from(cfg.app_name.clone()));

    let conn = match Connection::connect(&cfg.uri(), options).await {
        Ok(c) => Ok(c),
        Err(err) => {
            error!(error = err.to_string(), "failure to connect");
            Err(AmqpError::ConnectionError {})
        }
    }?;
    debug!("amqp connected");

    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!("channel created");
            Ok((Arc::new(conn), Arc::new(c)))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError {})
        }
    }
}

/// [`AmqpChannel`] backed by a lapin channel.
pub struct LapinChannel {
    // Held so the connection lives as long as the channel.
    _conn: Option<Arc<Connection>>,
    channel: Arc<Channel>,
}

impl LapinChannel {
    /// Wraps a channel whose connection is owned elsewhere.
    ///
    /// # Parameters
    /// * `channel` - An open lapin channel
    ///
    /// # Returns
    /// A transport over that channel
    pub fn new(channel: Arc<Channel>) -> Self {
        LapinChannel {
            _conn: None,
            channel,
        }
    }

    /// Connects using `cfg` and wraps the resulting channel.
    ///
    /// # Parameters
    /// * `cfg` - Host, credentials and application name
    ///
    /// # Returns
    /// A shared transport keeping its connection alive
    ///
    /// # Example
    /// ```ignore
    /// let cfg = RabbitMQConfigs::from_env();
    /// let channel = LapinChannel::connect(&cfg).await?;
    /// let messaging = RabbitMQMessaging::new(channel, cfg);
    /// ```
    pub async fn connect(cfg: &RabbitMQConfigs) -> Result<Arc<LapinChannel>, AmqpError> {
        let (conn, channel) = new_amqp_channel(cfg).await?;

        Ok(Arc::new(LapinChannel {
            _conn: Some(conn),
            channel,
        }))
    }
}

struct LapinAcker {
    acker: Acker,
}

#[async_trait]
impl DeliveryAcker for LapinAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })?;

        Ok(())
    }
}

/// Adapts a lapin delivery, keeping its acker for the later ack.
fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let lapin::message::Delivery {
        exchange,
        routing_key,
        redelivered,
        properties,
        data,
        acker,
        ..
    } = delivery;

    Delivery::new(
        exchange.as_str(),
        routing_key.as_str(),
        properties,
        data,
        Arc::new(LapinAcker { acker }),
    )
    .redelivered(redelivered)
}

/// Maps a failed bind to an error naming the exchange and the queue.
fn binding_error(binding: &QueueBinding, err: &lapin::Error) -> AmqpError {
    error!(
        error = err.to_string(),
        exchange = binding.exchange_name,
        queue = binding.queue_name,
        "error to bind queue to exchange"
    );
    AmqpError::BindingExchangeToQueueError(
        binding.exchange_name.clone(),
        binding.queue_name.clone(),
    )
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: def.no_wait,
                },
                FieldTable::from(def.params.clone()),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), exchange = def.name, "error to declare the exchange");
                AmqpError::DeclareExchangeError(def.name.clone())
            })
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: def.passive,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: def.no_wait,
                },
                def.arguments(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), queue = def.name, "error to declare the queue");
                AmqpError::DeclareQueueError(def.name.clone())
            })
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| binding_error(binding, &err))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))?;

        Ok(consumer
            .map(|result| {
                result
                    .map(into_delivery)
                    .map_err(|err| AmqpError::ConsumerError(err.to_string()))
            })
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                properties,
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError
            })
    }
}
