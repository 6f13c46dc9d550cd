// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Loop
//!
//! One loop runs per subscribed queue. A pump task moves deliveries from the
//! transport stream into a bounded channel; the processing task takes them
//! one at a time and runs dispatch, the ack/retry decision and the resulting
//! broker calls before looking at the next one. Handler order within a queue
//! therefore matches arrival order, and a slow handler stalls only its queue.
//!
//! Per-delivery failures are contained here: they end up in logs, on the
//! consumer span and in the ack/retry action, never in a returned error.

use crate::{
    controller::{self, AckAction, DispatchOutcome},
    dispatcher::dispatch,
    errors::AmqpError,
    handler::DeliveryMetadata,
    otel,
    params::SubscriptionParams,
    publisher::RabbitMQPublisher,
    registry::HandlerRegistry,
    transport::{header_str, Delivery, DeliveryStream, AMQP_HEADERS_TYPE},
};
use futures_util::StreamExt;
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{borrow::Cow, sync::Arc};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Everything a consumer loop needs to process deliveries for one subscription.
#[derive(Clone)]
pub(crate) struct ConsumerContext {
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) publisher: Arc<RabbitMQPublisher>,
    pub(crate) params: Arc<SubscriptionParams>,
    pub(crate) retry_delay_ms: i64,
}

/// Handle to a running consumer loop.
///
/// Dropping the handle leaves the loop running until the transport closes the stream.
#[derive(Debug)]
pub struct SubscriptionHandle {
    queue: String,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Name of the queue this loop consumes.
    ///
    /// # Returns
    /// The subscription's queue name
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stops the loop after the delivery currently being processed, if any.
    ///
    /// Buffered deliveries stay unacked and are redelivered by the broker once the channel closes.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Whether the loop already stopped, either cancelled or because the stream closed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to end without cancelling it.
    ///
    /// # Returns
    /// Ok once the loop stopped, or `InternalError` if the task panicked
    pub async fn join(self) -> Result<(), AmqpError> {
        self.task.await.map_err(|err| {
            error!(error = err.to_string(), "consumer task failure");
            AmqpError::InternalError
        })
    }

    /// Cancels the loop and waits for it to stop.
    pub async fn shutdown(self) -> Result<(), AmqpError> {
        self.cancel();
        self.join().await
    }
}

/// Starts the pump and processing tasks for one subscription.
///
/// # Parameters
/// * `stream` - Deliveries coming from the transport
/// * `ctx` - Registry, publisher and parameters used to process them
/// * `buffer` - Capacity of the channel between both tasks, at least 1
///
/// # Returns
/// A handle to stop or await the loop
pub(crate) fn spawn(stream: DeliveryStream, ctx: ConsumerContext, buffer: usize) -> SubscriptionHandle {
    let queue = ctx.params.queue_name.clone();
    let token = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<Delivery>(buffer.max(1));

    let pump_token = token.child_token();
    let pump_queue = queue.clone();
    tokio::spawn(async move {
        let mut stream = stream;
        loop {
            tokio::select! {
                _ = pump_token.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(delivery)) => {
                        if tx.send(delivery).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        error!(queue = pump_queue, error = err.to_string(), "errors consume msg");
                    }
                    None => break,
                },
            }
        }
        debug!(queue = pump_queue, "delivery stream closed");
    });

    let loop_token = token.clone();
    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = loop_token.cancelled() => {
                    info!(queue = ctx.params.queue_name, "consumer cancelled");
                    break;
                }
                received = rx.recv() => match received {
                    Some(delivery) => process(&ctx, &delivery).await,
                    None => break,
                },
            }
        }
    });

    SubscriptionHandle { queue, token, task }
}

/// Runs one delivery through dispatch, the ack/retry decision and the resulting broker calls.
pub(crate) async fn process(ctx: &ConsumerContext, delivery: &Delivery) {
    let params = ctx.params.as_ref();
    let headers = delivery.headers();
    let msg_type = header_str(&headers, AMQP_HEADERS_TYPE).unwrap_or_default();

    debug!(
        queue = params.queue_name,
        msg_type = msg_type,
        exchange = delivery.exchange,
        "received"
    );

    let (otel_ctx, mut span) = if params.enabled_telemetry {
        let (cx, span) = otel::new_span(&headers, &global::tracer(otel::CONSUMER_TRACER), &msg_type);
        (cx, Some(span))
    } else {
        (Context::current(), None)
    };

    let outcome = match dispatch(&ctx.registry, &params.queue_name, &headers, &delivery.data) {
        Err(reason) => DispatchOutcome::NoMatch(reason),
        Ok(resolved) => {
            info!(
                queue = params.queue_name,
                msg_type = resolved.msg_type,
                "message received"
            );

            let meta = DeliveryMetadata {
                queue: params.queue_name.clone(),
                msg_type: resolved.msg_type.clone(),
                exchange: delivery.exchange.clone(),
                routing_key: delivery.routing_key.clone(),
                redelivered: delivery.redelivered,
                headers: headers.clone(),
            };

            DispatchOutcome::Handled(resolved.exec(&otel_ctx, &meta).await)
        }
    };

    if let Some(span) = span.as_mut() {
        match &outcome {
            DispatchOutcome::Handled(Ok(())) => span.set_status(Status::Ok),
            DispatchOutcome::Handled(Err(err)) => {
                span.record_error(err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
            DispatchOutcome::NoMatch(reason) => {
                span.record_error(reason);
                span.set_status(Status::Error {
                    description: Cow::from(reason.to_string()),
                });
            }
        }
    }

    let action = controller::resolve(&outcome, params);

    if action == AckAction::RetryThenAck {
        if let Err(err) = ctx
            .publisher
            .republish_delayed(&otel_ctx, params, delivery, ctx.retry_delay_ms)
            .await
        {
            error!(
                queue = params.queue_name,
                error = err.to_string(),
                "failure to send msg to delayed exchange, msg will be lost"
            );
            if let Some(span) = span.as_mut() {
                span.record_error(&err);
            }
        }
    }

    if let Err(err) = delivery.ack().await {
        error!(queue = params.queue_name, error = err.to_string(), "error whiling ack msg");
        if let Some(span) = span.as_mut() {
            span.record_error(&err);
            span.set_status(Status::Error {
                description: Cow::from("error to ack msg"),
            });
        }
    }
}
