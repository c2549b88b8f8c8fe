//! Retry engine: drives one logical request to completion.
//!
//! # State Machine
//! ```text
//! ATTEMPT(n) ── ok, status < 500 ───────────────────────────▶ DONE
//!     │       ── ok, status >= 500, budget left ──▶ BACKOFF ─▶ ATTEMPT(n+1)
//!     │       ── err, retryable, budget left ─────▶ BACKOFF ─▶ ATTEMPT(n+1)
//!     └────── err, fatal or budget exhausted ─────────────────▶ FAILED
//! ```
//!
//! Budget means all of:
//! - `n < retries`
//! - elapsed time below `max_retry_time`
//! - the drawn delay fits in the remaining time
//! - the replay cache is still usable (no oversized body)
//! - the client has not gone away
//!
//! # Bypass
//! Retry disabled or streaming mode: exactly one attempt, no backoff.
//! A custom strategy replaces the loop entirely (see `replay`).

use std::time::{Duration, Instant};

use crate::proxy::context::{LogicalRequest, RequestContext};
use crate::proxy::error::ProxyError;
use crate::proxy::pipeline;
use crate::proxy::replay::ReplayHandle;
use crate::observability::metrics;
use crate::resilience::backoff::calculate_backoff;
use crate::resilience::retries::{should_retry_error, should_retry_status, RetryConfig};

/// Execute a logical request under the configured retry policy.
pub async fn execute_with_retry(logical: LogicalRequest) -> Result<RequestContext, ProxyError> {
    let retry = logical.options.retry.clone();

    if !retry.enabled {
        metrics::record_attempt("initial");
        return pipeline::execute(logical.first_attempt()).await;
    }

    if !logical.decision.is_buffered() {
        tracing::info!(
            request_id = %logical.inbound.id(),
            "Streaming mode detected; retry disabled for stream safety"
        );
        metrics::record_retry_disabled("streaming");
        metrics::record_attempt("initial");
        return pipeline::execute(logical.first_attempt()).await;
    }

    if let Some(strategy) = retry.custom_handler.clone() {
        let inbound = logical.inbound.clone();
        let handle = ReplayHandle::new(logical);
        return strategy.retry(handle, inbound).resolve().await;
    }

    run_builtin(logical, &retry).await
}

/// What the loop does after one attempt.
enum Next {
    Finish,
    Retry(Duration),
}

async fn run_builtin(logical: LogicalRequest, retry: &RetryConfig) -> Result<RequestContext, ProxyError> {
    let started = Instant::now();
    let request_id = logical.inbound.id();
    let mut attempt: u32 = 0;

    loop {
        let ctx = if attempt == 0 {
            logical.first_attempt()
        } else {
            match logical.cache.replay_body() {
                Some(body) => logical.replay(body),
                None => return Err(ProxyError::ReplayUnavailable),
            }
        };
        metrics::record_attempt(if attempt == 0 { "initial" } else { "retry" });

        let outcome = pipeline::execute(ctx).await;
        let retryable = match &outcome {
            Ok(ctx) => should_retry_status(ctx.status()),
            Err(error) => should_retry_error(error),
        };

        match schedule(&logical, retry, attempt, started, retryable) {
            Next::Finish => return outcome,
            Next::Retry(delay) => {
                let reason = match &outcome {
                    Ok(ctx) => {
                        tracing::info!(
                            request_id = %request_id,
                            attempt,
                            status = ctx.status().as_u16(),
                            delay_ms = delay.as_millis() as u64,
                            "Retrying request"
                        );
                        "status"
                    }
                    Err(error) => {
                        tracing::info!(
                            request_id = %request_id,
                            attempt,
                            error = %error,
                            delay_ms = delay.as_millis() as u64,
                            "Retrying after upstream error"
                        );
                        "error"
                    }
                };
                metrics::record_retry(reason);
                drop(outcome);

                tokio::select! {
                    biased;
                    _ = logical.inbound.abort_signal().aborted() => {
                        tracing::debug!(request_id = %request_id, "Client aborted during backoff");
                        return Err(ProxyError::ClientAborted);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Decide whether another attempt may run, and after which delay.
fn schedule(
    logical: &LogicalRequest,
    retry: &RetryConfig,
    attempt: u32,
    started: Instant,
    retryable: bool,
) -> Next {
    if !logical.cache.is_cachable() {
        tracing::debug!(request_id = %logical.inbound.id(), "Replay cache disabled; returning as-is");
        return Next::Finish;
    }
    if !retryable || attempt >= retry.retries || logical.inbound.is_aborted() {
        return Next::Finish;
    }

    let elapsed = started.elapsed();
    let remaining = match retry.max_retry_time {
        Some(budget) if elapsed >= budget => return Next::Finish,
        Some(budget) => Some(budget - elapsed),
        None => None,
    };

    let delay = calculate_backoff(attempt, retry.min_timeout, retry.max_timeout);
    match remaining {
        Some(remaining) if delay >= remaining => {
            tracing::debug!(
                request_id = %logical.inbound.id(),
                delay_ms = delay.as_millis() as u64,
                remaining_ms = remaining.as_millis() as u64,
                "Retry time budget exhausted"
            );
            Next::Finish
        }
        _ => Next::Retry(delay),
    }
}
