// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Outcome Classification
//!
//! Maps a handler result and the message's retry count onto the broker
//! action that completes the delivery.

/// The broker action a delivery ends with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Acknowledge the delivery.
    Ack,
    /// Republish a copy with an incremented retry count to the retry queue,
    /// then acknowledge the original.
    RetryDelayed,
    /// Reject without requeue; the main queue dead-letters it.
    DeadLetter,
}

impl DeliveryOutcome {
    /// Classifies a handled delivery. A `max_retries` of 0 sends every
    /// failure straight to the dead-letter queue.
    pub fn classify<T, E>(result: &Result<T, E>, retry_count: u32, max_retries: u32) -> Self {
        match result {
            Ok(_) => DeliveryOutcome::Ack,
            Err(_) if retry_count < max_retries => DeliveryOutcome::RetryDelayed,
            Err(_) => DeliveryOutcome::DeadLetter,
        }
    }
}
