// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod dispatcher;
mod otel;
mod resolver;

pub mod channel;
pub mod configs;
pub mod consumer;
pub mod controller;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod messaging;
pub mod params;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod topology;
pub mod transport;

pub use consumer::SubscriptionHandle;
pub use handler::{ConsumerHandler, DeliveryMetadata};
pub use messaging::RabbitMQMessaging;
pub use params::SubscriptionParams;
