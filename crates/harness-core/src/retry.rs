// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Error classification and retry-with-backoff, shared by the agent loop's
//! provider calls and the worker manager's task execution.
use std::future::Future;
use std::time::Duration;

use harness_model::CancelToken;
use thiserror::Error;

const NOT_RETRYABLE_STATUSES: &[u16] = &[400, 401, 403, 404, 405, 409, 422];
const RETRYABLE_STATUSES: &[u16] = &[429, 500, 502, 503, 504];
const TRANSIENT_PATTERNS: &[&str] = &[
    "econnrefused",
    "econnreset",
    "etimedout",
    "enetunreach",
    "ehostunreach",
    "enotfound",
    "socket hang up",
    "network",
    "timeout",
    "connection refused",
    "dns",
    "fetch failed",
];

/// An error as seen by the retry policy: an optional HTTP status, the
/// error's display message, and an optional server-supplied `Retry-After`
/// delay (already parsed to milliseconds via [`parse_retry_after`]).
#[derive(Debug, Clone)]
pub struct ClassifiableError {
    pub status: Option<u16>,
    pub message: String,
    pub retry_after_ms: Option<u64>,
}

impl ClassifiableError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn with_retry_after_ms(mut self, retry_after_ms: u64) -> Self {
        self.retry_after_ms = Some(retry_after_ms);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
}

/// Total function: every input maps to exactly one classification.
///
/// Priority: explicit non-retryable status table, then retryable status
/// table, then a case-insensitive transient-message pattern match, then
/// "not retryable" as the default.
pub fn classify_error(error: &ClassifiableError) -> Classification {
    if let Some(status) = error.status {
        if NOT_RETRYABLE_STATUSES.contains(&status) {
            return Classification { retryable: false };
        }
        if RETRYABLE_STATUSES.contains(&status) {
            return Classification { retryable: true };
        }
    }
    let lower = error.message.to_lowercase();
    if TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return Classification { retryable: true };
    }
    Classification { retryable: false }
}

/// Parse a `Retry-After` header value: integer seconds convert to
/// milliseconds (ceiling); otherwise parse as an HTTP date and return the
/// non-negative delta to now; otherwise `None`.
pub fn parse_retry_after(value: &str, now_ms: i64) -> Option<u64> {
    let trimmed = value.trim();
    if let Ok(seconds) = trimmed.parse::<f64>() {
        if seconds >= 0.0 {
            return Some((seconds * 1000.0).ceil() as u64);
        }
        return None;
    }
    if let Ok(date) = chrono::DateTime::parse_from_rfc2822(trimmed) {
        let target_ms = date.timestamp_millis();
        return Some((target_ms - now_ms).max(0) as u64);
    }
    None
}

/// `min(base * 2^attempt, max) + jitter in [0, 25% of the capped value]`.
pub fn calculate_backoff(
    attempt: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter: bool,
    random_source: &mut dyn FnMut() -> f64,
) -> u64 {
    let multiplier = 2u64.saturating_pow(attempt);
    let exp = base_delay_ms.saturating_mul(multiplier);
    let capped = exp.min(max_delay_ms);
    if !jitter {
        return capped;
    }
    let jitter_span = capped as f64 * 0.25;
    let jitter_amount = (random_source() * jitter_span).round() as u64;
    capped + jitter_amount
}

#[derive(Debug, Error)]
#[error("retry exhausted after {attempts} attempt(s): {last_error}")]
pub struct RetryExhaustedError {
    pub attempts: u32,
    pub last_error: String,
}

pub struct RetryOptions<'a> {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_duration_ms: u64,
    pub jitter: bool,
    pub cancel: CancelToken,
    pub now_ms: &'a dyn Fn() -> i64,
    pub random_source: &'a mut dyn FnMut() -> f64,
    pub sleep: &'a dyn Fn(Duration) -> std::pin::Pin<Box<dyn Future<Output = ()> + Send>>,
}

/// Retry `f` up to `options.max_attempts` times, honouring a cumulative
/// duration cap and cooperative cancellation. `f` returns `Ok` on success or
/// a [`ClassifiableError`] on failure; a non-retryable classification, an
/// exceeded duration cap, or attempt exhaustion all surface as a
/// [`RetryExhaustedError`].
pub async fn retry<T, F, Fut>(mut f: F, mut options: RetryOptions<'_>) -> Result<T, RetryExhaustedError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClassifiableError>>,
{
    let start = (options.now_ms)();
    let mut last_error: Option<ClassifiableError> = None;

    for attempt in 0..options.max_attempts {
        if options.cancel.is_cancelled() {
            return Err(RetryExhaustedError {
                attempts: attempt,
                last_error: last_error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "cancelled".to_string()),
            });
        }

        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                let classification = classify_error(&error);
                if !classification.retryable {
                    return Err(RetryExhaustedError {
                        attempts: attempt + 1,
                        last_error: error.message,
                    });
                }

                let is_last_attempt = attempt + 1 >= options.max_attempts;
                if is_last_attempt {
                    return Err(RetryExhaustedError {
                        attempts: attempt + 1,
                        last_error: error.message,
                    });
                }

                let now = (options.now_ms)();
                let elapsed = (now - start).max(0) as u64;
                let backoff = calculate_backoff(
                    attempt,
                    options.base_delay_ms,
                    options.max_delay_ms,
                    options.jitter,
                    options.random_source,
                );
                let wait_ms = backoff.max(error.retry_after_ms.unwrap_or(0));

                if elapsed + wait_ms > options.max_duration_ms {
                    return Err(RetryExhaustedError {
                        attempts: attempt + 1,
                        last_error: format!("{} (timeout reached)", error.message),
                    });
                }

                last_error = Some(error);

                let sleep_fut = (options.sleep)(Duration::from_millis(wait_ms));
                tokio::select! {
                    _ = sleep_fut => {}
                    _ = options.cancel.cancelled() => {
                        return Err(RetryExhaustedError {
                            attempts: attempt + 1,
                            last_error: last_error
                                .map(|e| e.message)
                                .unwrap_or_else(|| "cancelled".to_string()),
                        });
                    }
                }
            }
        }
    }

    Err(RetryExhaustedError {
        attempts: options.max_attempts,
        last_error: last_error
            .map(|e| e.message)
            .unwrap_or_else(|| "unknown error".to_string()),
    })
}
