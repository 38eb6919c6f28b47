// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Retry utilities.
//!
//! This module provides an API for retrying fallible asynchronous operations
//! until they succeed or until some criteria for giving up has been reached,
//! using exponential backoff between retries.
//!
//! # Examples
//!
//! Poll a contrived fallible operation until it succeeds:
//!
//! ```
//! use dbm_ore::retry::Retry;
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
//! # rt.block_on(async {
//! let res = Retry::default()
//!     .retry_async(|state| async move {
//!         if state.i == 2 {
//!             Ok(())
//!         } else {
//!             Err::<(), _>("contrived failure")
//!         }
//!     })
//!     .await;
//! assert_eq!(res, Ok(()));
//! # });
//! ```

use std::cmp;
use std::future::Future;
use std::time::{Duration, Instant};

/// The state of a retry operation constructed with [`Retry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryState {
    /// The retry counter, starting from zero on the first try.
    pub i: usize,
    /// The duration that the retry operation will sleep for before the next
    /// retry if this try fails.
    ///
    /// If this is the last attempt, then this field will be `None`.
    pub next_backoff: Option<Duration>,
}

/// The result of a retryable operation.
#[derive(Debug)]
pub enum RetryResult<T, E> {
    /// The operation was successful and does not need to be retried.
    Ok(T),
    /// The operation was unsuccessful but can be retried.
    RetryableErr(E),
    /// The operation was unsuccessful but cannot be retried.
    FatalErr(E),
}

impl<T, E> From<Result<T, E>> for RetryResult<T, E> {
    fn from(res: Result<T, E>) -> Self {
        match res {
            Ok(t) => RetryResult::Ok(t),
            Err(e) => RetryResult::RetryableErr(e),
        }
    }
}

/// Configures a retry operation.
///
/// See the [module documentation](self) for usage examples.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    initial_backoff: Duration,
    clamp_backoff: Duration,
    max_duration: Duration,
}

impl Default for Retry {
    /// Constructs a retry operation that will retry forever with backoff
    /// defaults that are reasonable for a fallible network operation.
    fn default() -> Self {
        Retry {
            initial_backoff: Duration::from_millis(125),
            clamp_backoff: Duration::MAX,
            max_duration: Duration::MAX,
        }
    }
}

impl Retry {
    /// Sets the initial backoff for the retry operation.
    ///
    /// The initial backoff is the amount of time to wait if the first try
    /// fails.
    pub fn initial_backoff(mut self, initial_backoff: Duration) -> Self {
        self.initial_backoff = initial_backoff;
        self
    }

    /// Clamps the maximum backoff for the retry operation.
    pub fn clamp_backoff(mut self, clamp_backoff: Duration) -> Self {
        self.clamp_backoff = clamp_backoff;
        self
    }

    /// Sets the maximum duration.
    ///
    /// If the operation is still failing after the specified `duration`, then
    /// the operation will be retried once more and [`Retry::retry_async`] will
    /// return the last error.
    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.max_duration = duration;
        self
    }

    /// Retries the fallible asynchronous operation `f` according to the
    /// configured policy, doubling the backoff after every failed try.
    pub async fn retry_async<F, U, R, T, E>(self, mut f: F) -> Result<T, E>
    where
        F: FnMut(RetryState) -> U,
        U: Future<Output = R>,
        R: Into<RetryResult<T, E>>,
    {
        let start = Instant::now();
        let mut i = 0;
        let mut next_backoff = Some(cmp::min(self.initial_backoff, self.clamp_backoff));
        loop {
            match self.next_state(start, i, next_backoff) {
                (state, None) => {
                    return match f(state).await.into() {
                        RetryResult::Ok(t) => Ok(t),
                        RetryResult::RetryableErr(e) | RetryResult::FatalErr(e) => Err(e),
                    };
                }
                (state, Some(backoff)) => match f(state).await.into() {
                    RetryResult::Ok(t) => return Ok(t),
                    RetryResult::FatalErr(e) => return Err(e),
                    RetryResult::RetryableErr(_) => {
                        tokio::time::sleep(backoff).await;
                        next_backoff = Some(self.grow(backoff));
                    }
                },
            }
            i += 1;
        }
    }

    /// Computes the state handed to the `i`th try, and the backoff to sleep
    /// for if that try fails. A `None` backoff marks the final try.
    fn next_state(
        &self,
        start: Instant,
        i: usize,
        next_backoff: Option<Duration>,
    ) -> (RetryState, Option<Duration>) {
        let elapsed = start.elapsed();
        let backoff = next_backoff.and_then(|backoff| {
            if elapsed >= self.max_duration {
                None
            } else {
                // Never sleep past the deadline.
                Some(cmp::min(backoff, self.max_duration.saturating_sub(elapsed)))
            }
        });
        (
            RetryState {
                i,
                next_backoff: backoff,
            },
            backoff,
        )
    }

    fn grow(&self, backoff: Duration) -> Duration {
        cmp::min(backoff.saturating_mul(2), self.clamp_backoff)
    }
}
