// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handlers
//!
//! A handler receives a payload already decoded into its declared type. It
//! never sees the raw delivery and never acks: the consumer loop acknowledges,
//! retries or drops the message according to the handler's result.

use crate::errors::HandlerError;
use async_trait::async_trait;
use lapin::types::FieldTable;
use opentelemetry::Context;

/// Information about the delivery a payload was decoded from.
#[derive(Debug, Clone, Default)]
pub struct DeliveryMetadata {
    /// Queue the delivery was consumed from
    pub queue: String,
    /// Declared-type identifier that selected the handler
    pub msg_type: String,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    /// All delivery headers, `x-retry-count` included for retried messages
    pub headers: FieldTable,
}

/// Processes payloads of type `T` consumed from a queue.
#[async_trait]
pub trait ConsumerHandler<T>: Send + Sync
where
    T: Send + Sync + 'static,
{
    /// Handles one decoded payload.
    ///
    /// Returning an error makes a retryable subscription republish the message
    /// to its delay exchange; otherwise the message is dropped.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context of the delivery
    /// * `msg` - The decoded payload
    /// * `meta` - Information about the delivery
    ///
    /// # Returns
    /// Ok when the message was processed
    async fn exec(
        &self,
        ctx: &Context,
        msg: &T,
        meta: &DeliveryMetadata,
    ) -> Result<(), HandlerError>;
}
