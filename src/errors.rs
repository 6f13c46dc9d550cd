// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Dispatch Runtime
//!
//! `AmqpError` covers everything that is surfaced to a caller: connection and
//! channel bootstrap, topology declaration, registration, subscription and
//! publishing. Per-delivery failures never leave the consumer loop; they are
//! described by [`NoMatch`] and [`HandlerError`] and resolved into an ack action.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect")]
    ConnectionError,

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// A caller supplied an unusable argument (empty queue name, empty type identifier...)
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding an exchange to a queue
    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// The transport refused to start consuming from a queue
    #[error("failure to subscribe to queue `{0}`")]
    SubscriptionError(String),

    /// Error publishing a message
    #[error("failure to publish")]
    PublishingError,

    /// Error serializing a message payload
    #[error("failure to serialize payload")]
    SerializePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error publishing a message to the delay exchange for a later retry
    #[error("failure to publish to the delay exchange `{0}`")]
    PublishingToDelayError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

/// Failure signal returned by a consumer handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("handler failure: {0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    /// Creates a handler error from a description of the failure.
    ///
    /// # Parameters
    /// * `msg` - What went wrong, written to logs and to the consumer span
    ///
    /// # Returns
    /// A new handler error
    pub fn new(msg: impl Into<String>) -> Self {
        HandlerError(msg.into())
    }
}

/// Reasons a delivery could not be routed to a handler.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoMatch {
    /// The delivery carried no string `type` header
    #[error("message without type header")]
    MissingTypeHeader,

    /// Nothing was registered for the delivery's queue
    #[error("there is no handler for this queue registered yet")]
    NoHandlerForQueue,

    /// No registered entry both matched the type header and decoded the body
    #[error("failure type coercion")]
    TypeCoercionFailed,
}
