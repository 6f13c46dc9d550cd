// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Builder
//!
//! Fluent declaration of exchanges, queues and bindings ahead of consumption.
//! Declarations are recorded in order and executed against the broker by
//! [`TopologyBuilder::build`]. The first failure wins: an invalid definition
//! makes every later call a no-op, a broker failure during `build` skips the
//! remaining declarations, and either way `build` returns that error.

use crate::{
    configs::RabbitMQConfigs,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    messaging::RabbitMQMessaging,
    params::SubscriptionParams,
    queue::{QueueBinding, QueueDefinition},
    transport::AmqpChannel,
};
use std::sync::Arc;
use tracing::{debug, error};

/// One recorded declaration, executed by [`TopologyBuilder::build`].
#[derive(Debug, Clone, PartialEq)]
enum TopologyStep {
    Exchange(ExchangeDefinition),
    Queue(QueueDefinition),
    Binding(QueueBinding),
}

/// Builder collecting exchanges, queues and bindings before installing them.
///
/// Each call returns the builder so declarations can be chained. Once a call
/// fails, the error is kept and every later call is ignored.
pub struct TopologyBuilder {
    channel: Arc<dyn AmqpChannel>,
    cfg: RabbitMQConfigs,
    steps: Vec<TopologyStep>,
    err: Option<AmqpError>,
}

impl TopologyBuilder {
    /// Creates an empty builder.
    ///
    /// # Parameters
    /// * `channel` - Transport the declarations are sent through
    /// * `cfg` - Configuration handed to the engine returned by `build`
    ///
    /// # Returns
    /// A builder without declarations or error
    pub fn new(channel: Arc<dyn AmqpChannel>, cfg: RabbitMQConfigs) -> TopologyBuilder {
        TopologyBuilder {
            channel,
            cfg,
            steps: vec![],
            err: None,
        }
    }

    /// The sticky error, if any call failed so far.
    ///
    /// # Returns
    /// The first error recorded, or None
    pub fn error(&self) -> Option<&AmqpError> {
        self.err.as_ref()
    }

    fn push(mut self, step: Result<TopologyStep, AmqpError>) -> Self {
        if self.err.is_some() {
            return self;
        }

        match step {
            Ok(step) => self.steps.push(step),
            Err(err) => {
                error!(error = err.to_string(), "invalid topology declaration");
                self.err = Some(err);
            }
        }

        self
    }

    /// Adds an exchange declaration.
    ///
    /// An empty exchange name sets the sticky error.
    ///
    /// # Parameters
    /// * `def` - An exchange definition
    ///
    /// # Returns
    /// Self for method chaining
    pub fn exchange(self, def: ExchangeDefinition) -> Self {
        let step = if def.name.is_empty() {
            Err(AmqpError::InvalidArgument("exchange name is empty".to_owned()))
        } else {
            Ok(TopologyStep::Exchange(def))
        };

        self.push(step)
    }

    /// Adds a queue declaration.
    ///
    /// An empty queue name sets the sticky error.
    ///
    /// # Parameters
    /// * `def` - A queue definition
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue(self, def: QueueDefinition) -> Self {
        let step = if def.name.is_empty() {
            Err(AmqpError::InvalidArgument("queue name is empty".to_owned()))
        } else {
            Ok(TopologyStep::Queue(def))
        };

        self.push(step)
    }

    /// Adds a queue-to-exchange binding.
    ///
    /// A binding without queue or exchange sets the sticky error.
    ///
    /// # Parameters
    /// * `binding` - A queue binding
    ///
    /// # Returns
    /// Self for method chaining
    pub fn queue_binding(self, binding: QueueBinding) -> Self {
        let step = if binding.queue_name.is_empty() || binding.exchange_name.is_empty() {
            Err(AmqpError::InvalidArgument(
                "binding requires a queue and an exchange".to_owned(),
            ))
        } else {
            Ok(TopologyStep::Binding(binding))
        };

        self.push(step)
    }

    /// Declares the subscription's exchange as durable.
    ///
    /// # Parameters
    /// * `params` - Subscription naming the exchange and its kind
    ///
    /// # Returns
    /// Self for method chaining
    pub fn assert_exchange(self, params: &SubscriptionParams) -> Self {
        let def = ExchangeDefinition::new(&params.exchange_name)
            .durable()
            .kind(params.exchange_kind);
        self.exchange(def)
    }

    /// Declares the subscription's queue as durable.
    ///
    /// # Parameters
    /// * `params` - Subscription naming the queue
    ///
    /// # Returns
    /// Self for method chaining
    pub fn assert_queue(self, params: &SubscriptionParams) -> Self {
        self.queue(QueueDefinition::new(&params.queue_name).durable())
    }

    /// Binds the subscription's queue to its exchange with its routing key.
    ///
    /// # Parameters
    /// * `params` - Subscription naming the queue, exchange and routing key
    ///
    /// # Returns
    /// Self for method chaining
    pub fn binding(self, params: &SubscriptionParams) -> Self {
        self.queue_binding(
            QueueBinding::new(&params.queue_name)
                .exchange(&params.exchange_name)
                .routing_key(&params.routing_key),
        )
    }

    /// Declares the delay exchange used to retry the subscription's failed
    /// messages and binds the queue to it.
    ///
    /// The delay exchange routes as `direct` whatever the subscription's own
    /// exchange kind, and the queue is bound with its own name as the key. Several
    /// queues can share one delay exchange without receiving each other's retries.
    ///
    /// # Parameters
    /// * `params` - Subscription whose failed messages should be retried
    ///
    /// # Returns
    /// Self for method chaining
    pub fn assert_delayed_exchange(self, params: &SubscriptionParams) -> Self {
        let delayed = params.delayed_exchange();

        self.exchange(
            ExchangeDefinition::new(&delayed)
                .durable()
                .delayed(ExchangeKind::Direct),
        )
        .queue_binding(
            QueueBinding::new(&params.queue_name)
                .exchange(&delayed)
                .routing_key(params.retry_routing_key()),
        )
    }

    /// Runs every recorded declaration in order and returns the ready engine.
    ///
    /// Exchanges, queues and bindings are installed in the order they were
    /// added. The first broker failure stops the installation.
    ///
    /// # Returns
    /// The messaging engine, or the sticky or first broker error
    pub async fn build(self) -> Result<RabbitMQMessaging, AmqpError> {
        if let Some(err) = self.err {
            return Err(err);
        }

        for step in &self.steps {
            self.install(step).await?;
        }

        Ok(RabbitMQMessaging::new(self.channel, self.cfg))
    }

    async fn install(&self, step: &TopologyStep) -> Result<(), AmqpError> {
        match step {
            TopologyStep::Exchange(def) => {
                debug!("creating exchange: {}", def.name);
                self.channel.exchange_declare(def).await.map_err(|err| {
                    error!(error = err.to_string(), name = def.name, "error to declare the exchange");
                    AmqpError::DeclareExchangeError(def.name.clone())
                })?;
                debug!("exchange: {} was created", def.name);
            }
            TopologyStep::Queue(def) => {
                debug!("creating queue: {}", def.name);
                self.channel.queue_declare(def).await.map_err(|err| {
                    error!(error = err.to_string(), name = def.name, "error to declare the queue");
                    AmqpError::DeclareQueueError(def.name.clone())
                })?;
                debug!("queue: {} was created", def.name);
            }
            TopologyStep::Binding(binding) => {
                debug!(
                    "binding queue: {} to the exchange: {} with the key: {}",
                    binding.queue_name, binding.exchange_name, binding.routing_key
                );
                self.channel.queue_bind(binding).await.map_err(|err| {
                    error!(error = err.to_string(), "error to bind queue to exchange");
                    AmqpError::BindingExchangeToQueueError(
                        binding.exchange_name.clone(),
                        binding.queue_name.clone(),
                    )
                })?;
            }
        }

        Ok(())
    }
}
