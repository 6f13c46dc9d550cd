// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Dispatcher
//!
//! Selects the handler for one inbound delivery. The `type` header names the
//! declared payload type; the queue's entries are scanned in registration
//! order and the first one whose identifier matches *and* whose decoder
//! accepts the body wins. An identifier match that fails to decode is skipped.
//! Registries are small, so the scan is linear and no index is kept.

use crate::{
    errors::{HandlerError, NoMatch},
    handler::DeliveryMetadata,
    registry::{ErasedHandler, HandlerRegistry},
    resolver::{try_resolve, DecodedPayload},
    transport::{header_str, AMQP_HEADERS_TYPE},
};
use lapin::types::FieldTable;
use opentelemetry::Context;
use std::sync::Arc;

/// A decoded payload together with the handler registered for it.
pub(crate) struct Resolved {
    pub(crate) msg_type: String,
    payload: DecodedPayload,
    handler: Arc<dyn ErasedHandler>,
}

impl Resolved {
    /// Runs the selected handler with the decoded payload.
    ///
    /// # Parameters
    /// * `ctx` - OpenTelemetry context of the delivery
    /// * `meta` - Delivery metadata handed to the handler
    ///
    /// # Returns
    /// The handler's result
    pub(crate) async fn exec(
        &self,
        ctx: &Context,
        meta: &DeliveryMetadata,
    ) -> Result<(), HandlerError> {
        self.handler.exec(ctx, &*self.payload, meta).await
    }
}

/// Picks the handler for one delivery on `queue`.
///
/// # Parameters
/// * `registry` - Registry holding the queue's entries
/// * `queue` - Queue the delivery was consumed from
/// * `headers` - Delivery headers, read for the `type` identifier
/// * `raw` - Delivery body
///
/// # Returns
/// The decoded payload and its handler, or why none could be selected:
/// `MissingTypeHeader`, `NoHandlerForQueue` or `TypeCoercionFailed`
pub(crate) fn dispatch(
    registry: &HandlerRegistry,
    queue: &str,
    headers: &FieldTable,
    raw: &[u8],
) -> Result<Resolved, NoMatch> {
    let msg_type = header_str(headers, AMQP_HEADERS_TYPE).ok_or(NoMatch::MissingTypeHeader)?;

    let entries = registry.entries(queue).ok_or(NoMatch::NoHandlerForQueue)?;

    entries
        .iter()
        .filter(|entry| entry.msg_type == msg_type)
        .find_map(|entry| {
            try_resolve(entry, raw).map(|payload| Resolved {
                msg_type: entry.msg_type.clone(),
                payload,
                handler: entry.handler.clone(),
            })
        })
        .ok_or(NoMatch::TypeCoercionFailed)
}
