// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Handler Registry
//!
//! Maps a queue name to the ordered list of payload types that queue accepts.
//! Every entry pairs a declared-type identifier with a decode function and a
//! type-erased handler. The registry is append-only: entries are never removed
//! and are tried in registration order.
//!
//! Reads happen on every delivery while registrations may still be running, so
//! the map sits behind a read-write lock. Consumer loops take a snapshot of a
//! queue's entries and release the lock before any handler runs.

use crate::{
    errors::{AmqpError, HandlerError},
    handler::{ConsumerHandler, DeliveryMetadata},
    resolver::{decode_json, DecodeFn},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{
    any::Any,
    collections::HashMap,
    fmt,
    marker::PhantomData,
    sync::{Arc, PoisonError, RwLock},
};
use tracing::debug;

/// Handler invoked with a payload whose type was fixed at registration time.
#[async_trait]
pub(crate) trait ErasedHandler: Send + Sync {
    async fn exec(
        &self,
        ctx: &Context,
        payload: &(dyn Any + Send + Sync),
        meta: &DeliveryMetadata,
    ) -> Result<(), HandlerError>;
}

struct TypedHandler<T: Send + Sync + 'static> {
    inner: Arc<dyn ConsumerHandler<T>>,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T> ErasedHandler for TypedHandler<T>
where
    T: Send + Sync + 'static,
{
    async fn exec(
        &self,
        ctx: &Context,
        payload: &(dyn Any + Send + Sync),
        meta: &DeliveryMetadata,
    ) -> Result<(), HandlerError> {
        let Some(msg) = payload.downcast_ref::<T>() else {
            return Err(HandlerError::new(format!(
                "payload is not a `{}`",
                std::any::type_name::<T>()
            )));
        };

        self.inner.exec(ctx, msg, meta).await
    }
}

/// One (declared type, decoder, handler) tuple bound to a queue.
pub(crate) struct DispatcherEntry {
    pub(crate) queue: String,
    pub(crate) msg_type: String,
    pub(crate) decode: DecodeFn,
    pub(crate) handler: Arc<dyn ErasedHandler>,
}

impl fmt::Debug for DispatcherEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherEntry")
            .field("queue", &self.queue)
            .field("msg_type", &self.msg_type)
            .finish_non_exhaustive()
    }
}

/// Queue-to-handlers map shared by every consumer loop.
#[derive(Default)]
pub struct HandlerRegistry {
    dispatchers: RwLock<HashMap<String, Vec<Arc<DispatcherEntry>>>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        HandlerRegistry::default()
    }

    /// Appends a handler for payloads of type `T` identified by `msg_type` on `queue`.
    ///
    /// Duplicate identifiers are kept; dispatch uses the first one that decodes.
    ///
    /// # Parameters
    /// * `queue` - Queue the handler consumes
    /// * `msg_type` - Value of the `type` header routed to this handler
    /// * `handler` - Handler receiving decoded payloads
    ///
    /// # Returns
    /// Ok, or `InvalidArgument` when the queue name or type is empty
    pub fn register<T>(
        &self,
        queue: &str,
        msg_type: &str,
        handler: Arc<dyn ConsumerHandler<T>>,
    ) -> Result<(), AmqpError>
    where
        T: DeserializeOwned + Send + Sync + 'static,
    {
        if queue.is_empty() {
            return Err(AmqpError::InvalidArgument("queue name is empty".to_owned()));
        }

        if msg_type.is_empty() {
            return Err(AmqpError::InvalidArgument(
                "declared message type is empty".to_owned(),
            ));
        }

        let entry = DispatcherEntry {
            queue: queue.to_owned(),
            msg_type: msg_type.to_owned(),
            decode: decode_json::<T>,
            handler: Arc::new(TypedHandler {
                inner: handler,
                _payload: PhantomData,
            }),
        };

        self.dispatchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(queue.to_owned())
            .or_default()
            .push(Arc::new(entry));

        debug!(queue = queue, msg_type = msg_type, "dispatcher registered");

        Ok(())
    }

    /// Snapshot of the entries registered for `queue`, in registration order.
    pub(crate) fn entries(&self, queue: &str) -> Option<Vec<Arc<DispatcherEntry>>> {
        self.dispatchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(queue)
            .cloned()
    }

    /// Number of entries registered for `queue`.
    pub fn len(&self, queue: &str) -> usize {
        self.entries(queue).map_or(0, |entries| entries.len())
    }

    /// Whether no queue has any entry.
    pub fn is_empty(&self) -> bool {
        self.dispatchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dispatchers = self.dispatchers.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_map().entries(dispatchers.iter()).finish()
    }
}
