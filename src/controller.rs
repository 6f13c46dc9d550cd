// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledge/Retry Controller
//!
//! Turns the outcome of dispatching one delivery into the action the consumer
//! loop applies. Every action ends with a positive ack of the original
//! delivery; the only difference is whether the message is first republished
//! to the delay exchange. Nothing is ever nacked or requeued on the source queue.
//!
//! Messages that cannot be routed or decoded are never retried: a delay does
//! not fix a malformed message.

use crate::{
    errors::{HandlerError, NoMatch},
    params::SubscriptionParams,
};
use tracing::{debug, error, info, warn};

/// What happened to a delivery before the ack decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No handler could be selected.
    NoMatch(NoMatch),
    /// A handler ran and returned this result.
    Handled(Result<(), HandlerError>),
}

/// Terminal action for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    /// Acknowledge and forget the message.
    Ack,
    /// Republish the message to the delay exchange, then acknowledge it.
    RetryThenAck,
}

/// Decides how the consumer loop finishes with a delivery, and logs why.
///
/// # Parameters
/// * `outcome` - Result of dispatching the delivery
/// * `params` - Subscription the delivery belongs to
///
/// # Returns
/// `RetryThenAck` for a failed handler on a retryable subscription, `Ack` otherwise
pub fn resolve(outcome: &DispatchOutcome, params: &SubscriptionParams) -> AckAction {
    let queue = params.queue_name.as_str();

    match outcome {
        DispatchOutcome::NoMatch(reason @ (NoMatch::MissingTypeHeader | NoMatch::NoHandlerForQueue)) => {
            warn!(queue = queue, "ignore message reason: {}", reason);
            AckAction::Ack
        }
        DispatchOutcome::NoMatch(reason @ NoMatch::TypeCoercionFailed) => {
            error!(queue = queue, "ignore message reason: {}", reason);
            AckAction::Ack
        }
        DispatchOutcome::Handled(Ok(())) => {
            info!(queue = queue, "message properly processed");
            AckAction::Ack
        }
        DispatchOutcome::Handled(Err(err)) if !params.retryable => {
            warn!(
                queue = queue,
                error = err.to_string(),
                "message has no retry policy, purging message"
            );
            AckAction::Ack
        }
        DispatchOutcome::Handled(Err(err)) => {
            debug!(
                queue = queue,
                error = err.to_string(),
                "sending failure msg to delayed exchange"
            );
            AckAction::RetryThenAck
        }
    }
}
