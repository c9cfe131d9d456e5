// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Redelivery
//!
//! At-least-once consumption over RabbitMQ with bounded, broker-delayed
//! retries and dead-lettering, plus a reusable backoff retry executor.
//!
//! ```ignore
//! let (conn, channel) = new_amqp_channel(&AmqpConfigs::from_env(), &ShutdownSignal::never()).await?;
//! let producer = RabbitMQPublisher::new(channel, Duration::from_secs(5));
//! let dispatcher = RabbitMQDispatcher::new(conn, SubscriptionConfigs::from_env());
//!
//! let subscription = dispatcher
//!     .subscribe("orders", 3, Arc::new(handler_fn(|msg: Message| async move {
//!         let order: Order = msg.decode_json()?;
//!         process(order).await.map_err(HandlerError::new)
//!     })))
//!     .await?;
//! ```

mod consumer;
mod otel;

pub mod backoff;
pub mod channel;
pub mod configs;
pub mod delivery;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod handler;
pub mod message;
pub mod outcome;
pub mod publisher;
pub mod queue;
pub mod retry;
pub mod shutdown;
pub mod topology;
