// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Definitions
//!
//! Types for the queues and bindings of the retry topology. For a topic `T`
//! the topology holds:
//!
//! - `T`: the main queue, dead-lettering rejected messages into `T.dlx`
//! - `T.retry`: holds republished messages for a fixed TTL, then dead-letters
//!   them through the default exchange back into `T`
//! - `T.dlx` / `T.dlq`: the dead-letter exchange and the queue bound to it

use std::time::Duration;

/// Suffix of the TTL-based retry queue.
pub const RETRY_QUEUE_SUFFIX: &str = ".retry";
/// Suffix of the dead-letter queue.
pub const DLQ_SUFFIX: &str = ".dlq";
/// Suffix of the dead-letter exchange.
pub const DLX_SUFFIX: &str = ".dlx";

pub fn retry_queue_name(topic: &str) -> String {
    format!("{topic}{RETRY_QUEUE_SUFFIX}")
}

pub fn dlq_name(topic: &str) -> String {
    format!("{topic}{DLQ_SUFFIX}")
}

pub fn dlx_name(topic: &str) -> String {
    format!("{topic}{DLX_SUFFIX}")
}

/// Where a queue routes the messages it dead-letters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    /// Exchange name; empty for the default exchange.
    pub exchange: String,
    pub routing_key: Option<String>,
}

/// Definition of a RabbitMQ queue.
///
/// Two definitions with the same name but different fields describe a
/// conflicting declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) ttl: Option<Duration>,
    pub(crate) dead_letter: Option<DeadLetterTarget>,
}

impl QueueDefinition {
    /// Creates a non-durable queue definition without arguments.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the per-message Time-To-Live of the queue. Expired messages are
    /// dead-lettered when a target is configured.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Routes rejected and expired messages to `exchange` with `routing_key`.
    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dead_letter = Some(DeadLetterTarget {
            exchange: exchange.to_owned(),
            routing_key: Some(routing_key.to_owned()),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn message_ttl(&self) -> Option<Duration> {
        self.ttl
    }

    pub fn dead_letter_target(&self) -> Option<&DeadLetterTarget> {
        self.dead_letter.as_ref()
    }
}

/// Binding of a queue to an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
}

impl QueueBinding {
    /// Creates a new binding for the given queue. The exchange and routing
    /// key default to empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
        }
    }

    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    pub fn key(&self) -> &str {
        &self.routing_key
    }
}
