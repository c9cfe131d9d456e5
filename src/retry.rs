// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Executor
//!
//! Runs a failable asynchronous operation under a [`BackoffConfig`]. The
//! operation is awaited on the caller's task; between attempts the caller is
//! suspended for the backoff delay, and that wait is interruptible by a
//! [`ShutdownSignal`].
//!
//! The executor adds no idempotency of its own: an operation that performs
//! network writes may run more than once.

use crate::{backoff::BackoffConfig, shutdown::ShutdownSignal};
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure returned by [`execute`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// The shutdown signal fired while waiting for the next attempt.
    #[error("retry cancelled while waiting for the next attempt")]
    Cancelled,

    /// Every attempt failed; holds the failure of the last one.
    #[error("{0}")]
    Operation(E),
}

impl<E> RetryError<E> {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }

    /// Returns the operation failure, if this is not a cancellation.
    pub fn into_operation(self) -> Option<E> {
        match self {
            RetryError::Operation(err) => Some(err),
            RetryError::Cancelled => None,
        }
    }
}

/// Invokes `operation` up to `config.attempts()` times, returning on the
/// first success.
///
/// # Returns
/// * `Ok(T)` - the first successful result
/// * `Err(RetryError::Operation(e))` - `e` is the failure of the last attempt
/// * `Err(RetryError::Cancelled)` - `shutdown` fired during a backoff wait
pub async fn execute<T, E, F, Fut>(
    shutdown: &ShutdownSignal,
    config: &BackoffConfig,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.attempts();
    let mut attempt = 0;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        attempt += 1;
        if attempt >= attempts {
            warn!(error = err.to_string(), attempts, "retry attempts exhausted");
            return Err(RetryError::Operation(err));
        }

        let delay = config.next_delay(attempt - 1);
        debug!(
            error = err.to_string(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "attempt failed, backing off"
        );

        tokio::select! {
            biased;
            _ = shutdown.triggered() => {
                debug!(attempt, "retry cancelled");
                return Err(RetryError::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
