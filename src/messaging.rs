// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messaging Engine
//!
//! [`RabbitMQMessaging`] owns the handler registry and the publisher and
//! starts consumer loops. The usual lifecycle is: build the topology, register
//! every dispatcher, then subscribe each queue.
//!
//! ```ignore
//! let channel = LapinChannel::connect(&cfg).await?;
//! let messaging = RabbitMQMessaging::builder(channel, cfg)
//!     .assert_exchange(&params)
//!     .assert_queue(&params)
//!     .binding(&params)
//!     .assert_delayed_exchange(&params)
//!     .build()
//!     .await?;
//!
//! messaging.add_dispatcher::<OrderCreated>(&params.queue_name, Arc::new(OrderHandler))?;
//! let handle = messaging.subscribe(&params).await?;
//! ```

use crate::{
    configs::RabbitMQConfigs,
    consumer::{self, ConsumerContext, SubscriptionHandle},
    errors::AmqpError,
    handler::ConsumerHandler,
    params::SubscriptionParams,
    publisher::{PublishOptions, RabbitMQPublisher},
    registry::HandlerRegistry,
    topology::TopologyBuilder,
    transport::AmqpChannel,
};
use opentelemetry::Context;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

/// Messaging engine: registry, publisher and consumer loops over one channel.
pub struct RabbitMQMessaging {
    channel: Arc<dyn AmqpChannel>,
    cfg: RabbitMQConfigs,
    registry: Arc<HandlerRegistry>,
    publisher: Arc<RabbitMQPublisher>,
}

impl RabbitMQMessaging {
    /// Creates an engine over an already configured broker.
    ///
    /// # Parameters
    /// * `channel` - Transport used to consume and publish
    /// * `cfg` - Retry delay and delivery buffer used by consumer loops
    ///
    /// # Returns
    /// An engine with an empty registry
    pub fn new(channel: Arc<dyn AmqpChannel>, cfg: RabbitMQConfigs) -> Self {
        RabbitMQMessaging {
            publisher: RabbitMQPublisher::new(channel.clone()),
            channel,
            cfg,
            registry: Arc::new(HandlerRegistry::new()),
        }
    }

    /// Starts a topology declaration that yields the engine once installed.
    ///
    /// # Parameters
    /// * `channel` - Transport used to declare, consume and publish
    /// * `cfg` - Configuration handed to the engine
    ///
    /// # Returns
    /// An empty topology builder
    pub fn builder(channel: Arc<dyn AmqpChannel>, cfg: RabbitMQConfigs) -> TopologyBuilder {
        TopologyBuilder::new(channel, cfg)
    }

    /// Registry shared by every consumer loop of this engine.
    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Publisher sharing this engine's channel.
    pub fn publisher(&self) -> Arc<RabbitMQPublisher> {
        self.publisher.clone()
    }

    /// Registers `handler` for payloads of type `T` on `queue`.
    ///
    /// The declared-type identifier is the fully-qualified name of `T`.
    ///
    /// # Parameters
    /// * `queue` - Queue the handler consumes
    /// * `handler` - Handler receiving decoded payloads
    ///
    /// # Returns
    /// Ok, or `InvalidArgument` when the queue name is empty
    pub fn add_dispatcher<T>(
        &self,
        queue: &str,
        handler: Arc<dyn ConsumerHandler<T>>,
    ) -> Result<(), AmqpError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.add_dispatcher_with_type(queue, std::any::type_name::<T>(), handler)
    }

    /// Registers `handler` for payloads of type `T` announced as `msg_type`.
    ///
    /// # Parameters
    /// * `queue` - Queue the handler consumes
    /// * `msg_type` - Value of the `type` header routed to this handler
    /// * `handler` - Handler receiving decoded payloads
    ///
    /// # Returns
    /// Ok, or `InvalidArgument` when the queue name or type is empty
    pub fn add_dispatcher_with_type<T>(
        &self,
        queue: &str,
        msg_type: &str,
        handler: Arc<dyn ConsumerHandler<T>>,
    ) -> Result<(), AmqpError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        self.registry.register(queue, msg_type, handler)
    }

    /// Starts consuming `params.queue_name` in a background loop.
    ///
    /// Each delivery is dispatched to the first registered handler whose type
    /// matches and whose payload decodes, then acked. Failed handlers of a
    /// retryable subscription get their message republished to the delay
    /// exchange first. Dispatchers must be registered before calling this.
    ///
    /// # Parameters
    /// * `params` - Subscription to consume
    ///
    /// # Returns
    /// A handle to stop or await the loop, or `SubscriptionError` when the
    /// broker refuses the consumer
    ///
    /// # Example
    /// ```ignore
    /// let params = SubscriptionParams::new("orders", ExchangeKind::Direct, "orders", "order.created")
    ///     .retryable();
    /// let handle = messaging.subscribe(&params).await?;
    /// // ...
    /// handle.shutdown().await?;
    /// ```
    pub async fn subscribe(
        &self,
        params: &SubscriptionParams,
    ) -> Result<SubscriptionHandle, AmqpError> {
        if params.queue_name.is_empty() {
            return Err(AmqpError::InvalidArgument("queue name is empty".to_owned()));
        }

        let consumer_tag = format!("{}-{}", params.queue_name, Uuid::new_v4());

        let stream = self
            .channel
            .consume(&params.queue_name, &consumer_tag)
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    queue = params.queue_name,
                    "error to create the consumer"
                );
                AmqpError::SubscriptionError(params.queue_name.clone())
            })?;

        debug!(queue = params.queue_name, consumer_tag = consumer_tag, "consumer started");

        let ctx = ConsumerContext {
            registry: self.registry.clone(),
            publisher: self.publisher.clone(),
            params: Arc::new(params.clone()),
            retry_delay_ms: self.cfg.retry_delay_ms,
        };

        Ok(consumer::spawn(stream, ctx, self.cfg.delivery_buffer))
    }

    /// Publishes `payload` to the subscription's exchange and routing key.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context injected when telemetry is enabled
    /// * `params` - Subscription naming the exchange and routing key
    /// * `payload` - The message to serialise as JSON
    /// * `opts` - Type identifier, headers and delay
    ///
    /// # Returns
    /// Ok, or `SerializePayloadError`/`PublishingError`
    ///
    /// # Example
    /// ```ignore
    /// let opts = PublishOptions::default().msg_type("OrderCreated");
    /// messaging.publish(&Context::current(), &params, &order, opts).await?;
    /// ```
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
        self.publisher.publish(ctx, params, payload, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        errors::HandlerError,
        exchange::ExchangeKind,
        handler::DeliveryMetadata,
        transport::{
            Delivery, DeliveryAcker, MockAmqpChannel, MockDeliveryAcker, AMQP_HEADERS_TYPE,
        },
    };
    use async_trait::async_trait;
    use futures_util::{stream, StreamExt};
    use lapin::{
        types::{AMQPValue, FieldTable, LongString, ShortString},
        BasicProperties,
    };
    use mockall::Sequence;
    use serde::Deserialize;
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    #[derive(Debug, Deserialize)]
    struct OrderCreated {
        id: u64,
    }

    struct OrderHandler {
        calls: Arc<Mutex<Vec<u64>>>,
        fail: bool,
    }

    #[async_trait]
    impl ConsumerHandler<OrderCreated> for OrderHandler {
        async fn exec(
            &self,
            _: &Context,
            msg: &OrderCreated,
            meta: &DeliveryMetadata,
        ) -> Result<(), HandlerError> {
            assert_eq!(meta.queue, "orders");
            self.calls.lock().unwrap().push(msg.id);

            if self.fail {
                return Err(HandlerError::new("database unavailable"));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingAcker {
        acks: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryAcker for CountingAcker {
        async fn ack(&self) -> Result<(), AmqpError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FailingAcker {
        acks: AtomicUsize,
    }

    #[async_trait]
    impl DeliveryAcker for FailingAcker {
        async fn ack(&self) -> Result<(), AmqpError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Err(AmqpError::AckMessageError)
        }
    }

    fn params() -> SubscriptionParams {
        SubscriptionParams::new("orders", ExchangeKind::Direct, "orders", "order.created")
    }

    fn delivery(msg_type: Option<&str>, body: &[u8], acker: Arc<dyn DeliveryAcker>) -> Delivery {
        let mut headers = BTreeMap::new();
        if let Some(msg_type) = msg_type {
            headers.insert(
                ShortString::from(AMQP_HEADERS_TYPE),
                AMQPValue::LongString(LongString::from(msg_type)),
            );
        }

        Delivery::new(
            "orders",
            "order.created",
            BasicProperties::default().with_headers(FieldTable::from(headers)),
            body.to_vec(),
            acker,
        )
    }

    fn consuming(channel: &mut MockAmqpChannel, deliveries: Vec<Delivery>) {
        let items: Vec<Result<Delivery, AmqpError>> = deliveries.into_iter().map(Ok).collect();
        channel
            .expect_consume()
            .withf(|queue, tag| queue == "orders" && tag.starts_with("orders-"))
            .times(1)
            .return_once(move |_, _| Ok(stream::iter(items).boxed()));
    }

    fn handler(calls: &Arc<Mutex<Vec<u64>>>, fail: bool) -> Arc<dyn ConsumerHandler<OrderCreated>> {
        Arc::new(OrderHandler {
            calls: calls.clone(),
            fail,
        })
    }

    #[tokio::test]
    async fn should_invoke_handler_and_ack_decoded_message() {
        let acker = Arc::new(CountingAcker::default());
        let mut channel = MockAmqpChannel::new();
        consuming(
            &mut channel,
            vec![delivery(Some("OrderCreated"), br#"{"id":1}"#, acker.clone())],
        );
        channel.expect_publish().never();

        let messaging = RabbitMQMessaging::new(Arc::new(channel), RabbitMQConfigs::default());
        let calls = Arc::default();
        messaging
            .add_dispatcher_with_type("orders", "OrderCreated", handler(&calls, false))
            .unwrap();

        let handle = messaging.subscribe(&params()).await.unwrap();
        assert_eq!(handle.queue(), "orders");
        handle.join().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![1]);
        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_ack_message_without_type_header() {
        let acker = Arc::new(CountingAcker::default());
        let mut channel = MockAmqpChannel::new();
        consuming(&mut channel, vec![delivery(None, b"...", acker.clone())]);
        channel.expect_publish().never();

        let messaging = RabbitMQMessaging::new(Arc::new(channel), RabbitMQConfigs::default());
        let calls = Arc::default();
        messaging
            .add_dispatcher_with_type("orders", "OrderCreated", handler(&calls, false))
            .unwrap();

        messaging.subscribe(&params().retryable()).await.unwrap().join().await.unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_republish_to_delay_exchange_then_ack_when_retryable() {
        let mut seq = Sequence::new();
        let mut channel = MockAmqpChannel::new();
        let mut acker = MockDeliveryAcker::new();

        channel
            .expect_publish()
            .withf(|exchange, key, payload, _| {
                exchange == "orders.delayed" && key == "orders" && payload == br#"{"id":3}"#
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _, _| Ok(()));
        acker
            .expect_ack()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));

        consuming(
            &mut channel,
            vec![delivery(Some("OrderCreated"), br#"{"id":3}"#, Arc::new(acker))],
        );

        let messaging = RabbitMQMessaging::new(Arc::new(channel), RabbitMQConfigs::default());
        let calls = Arc::default();
        messaging
            .add_dispatcher_with_type("orders", "OrderCreated", handler(&calls, true))
            .unwrap();

        messaging.subscribe(&params().retryable()).await.unwrap().join().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn should_ack_once_when_delay_exchange_refuses_republish() {
        let acker = Arc::new(CountingAcker::default());
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .times(1)
            .returning(|_, _, _, _| Err(AmqpError::ChannelError));
        consuming(
            &mut channel,
            vec![delivery(Some("OrderCreated"), br#"{"id":7}"#, acker.clone())],
        );

        let messaging = RabbitMQMessaging::new(Arc::new(channel), RabbitMQConfigs::default());
        let calls = Arc::default();
        messaging
            .add_dispatcher_with_type("orders", "OrderCreated", handler(&calls, true))
            .unwrap();

        messaging.subscribe(&params().retryable()).await.unwrap().join().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![7]);
        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_keep_consuming_after_ack_failure() {
        let first = Arc::new(FailingAcker::default());
        let second = Arc::new(CountingAcker::default());
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_publish()
            .times(2)
            .returning(|_, _, _, _| Err(AmqpError::ChannelError));
        consuming(
            &mut channel,
            vec![
                delivery(Some("OrderCreated"), br#"{"id":8}"#, first.clone()),
                delivery(Some("OrderCreated"), br#"{"id":9}"#, second.clone()),
            ],
        );

        let messaging = RabbitMQMessaging::new(Arc::new(channel), RabbitMQConfigs::default());
        let calls = Arc::default();
        messaging
            .add_dispatcher_with_type("orders", "OrderCreated", handler(&calls, true))
            .unwrap();

        let res = messaging.subscribe(&params().retryable()).await.unwrap().join().await;

        assert!(res.is_ok());
        assert_eq!(*calls.lock().unwrap(), vec![8, 9]);
        assert_eq!(first.acks.load(Ordering::SeqCst), 1);
        assert_eq!(second.acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_purge_failed_message_when_not_retryable() {
        let acker = Arc::new(CountingAcker::default());
        let mut channel = MockAmqpChannel::new();
        consuming(
            &mut channel,
            vec![delivery(Some("OrderCreated"), br#"{"id":4}"#, acker.clone())],
        );
        channel.expect_publish().never();

        let messaging = RabbitMQMessaging::new(Arc::new(channel), RabbitMQConfigs::default());
        let calls = Arc::default();
        messaging
            .add_dispatcher_with_type("orders", "OrderCreated", handler(&calls, true))
            .unwrap();

        messaging.subscribe(&params()).await.unwrap().join().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![4]);
        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_ack_unknown_type_without_retry() {
        let acker = Arc::new(CountingAcker::default());
        let mut channel = MockAmqpChannel::new();
        consuming(
            &mut channel,
            vec![delivery(Some("Unknown"), br#"{"id":5}"#, acker.clone())],
        );
        channel.expect_publish().never();

        let messaging = RabbitMQMessaging::new(Arc::new(channel), RabbitMQConfigs::default());
        let calls = Arc::default();
        messaging
            .add_dispatcher_with_type("orders", "OrderCreated", handler(&calls, true))
            .unwrap();

        messaging.subscribe(&params().retryable()).await.unwrap().join().await.unwrap();

        assert!(calls.lock().unwrap().is_empty());
        assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn should_process_deliveries_in_arrival_order_and_ack_each_once() {
        let ackers: Vec<_> = (0..5).map(|_| Arc::new(CountingAcker::default())).collect();
        let deliveries = ackers
            .iter()
            .enumerate()
            .map(|(i, acker)| {
                let body = format!(r#"{{"id":{i}}}"#);
                let msg_type = if i == 2 { None } else { Some("OrderCreated") };
                delivery(msg_type, body.as_bytes(), acker.clone())
            })
            .collect();

        let mut channel = MockAmqpChannel::new();
        consuming(&mut channel, deliveries);

        let cfg = RabbitMQConfigs {
            delivery_buffer: 1,
            ..RabbitMQConfigs::default()
        };
        let messaging = RabbitMQMessaging::new(Arc::new(channel), cfg);
        let calls = Arc::default();
        messaging
            .add_dispatcher_with_type("orders", "OrderCreated", handler(&calls, false))
            .unwrap();

        messaging.subscribe(&params()).await.unwrap().join().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![0, 1, 3, 4]);
        for acker in ackers {
            assert_eq!(acker.acks.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn should_use_type_name_as_default_identifier() {
        let acker = Arc::new(CountingAcker::default());
        let mut channel = MockAmqpChannel::new();
        consuming(
            &mut channel,
            vec![delivery(
                Some(std::any::type_name::<OrderCreated>()),
                br#"{"id":6}"#,
                acker.clone(),
            )],
        );

        let messaging = RabbitMQMessaging::new(Arc::new(channel), RabbitMQConfigs::default());
        let calls = Arc::default();
        messaging.add_dispatcher("orders", handler(&calls, false)).unwrap();

        messaging.subscribe(&params()).await.unwrap().join().await.unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![6]);
    }

    #[tokio::test]
    async fn should_fail_subscription_when_transport_refuses() {
        let mut channel = MockAmqpChannel::new();
        channel
            .expect_consume()
            .returning(|_, _| Err(AmqpError::ConsumerError("NOT_FOUND".to_owned())));

        let messaging = RabbitMQMessaging::new(Arc::new(channel), RabbitMQConfigs::default());
        let res = messaging.subscribe(&params()).await;

        assert!(matches!(res, Err(AmqpError::SubscriptionError(queue)) if queue == "orders"));
    }

    #[tokio::test]
    async fn should_reject_invalid_registrations() {
        let messaging =
            RabbitMQMessaging::new(Arc::new(MockAmqpChannel::new()), RabbitMQConfigs::default());
        let calls = Arc::default();

        let res = messaging.add_dispatcher("", handler(&calls, false));

        assert!(matches!(res, Err(AmqpError::InvalidArgument(_))));
        assert_eq!(messaging.registry().len("orders"), 0);
    }
}
