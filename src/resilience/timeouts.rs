//! Two-phase timeout enforcement for upstream attempts.
//!
//! # Phases
//! ```text
//! connect ──(connection established / TLS handshake done)──▶ exchange
//! ```
//! - With a connect timeout, the connect phase is bounded by it and the
//!   exchange phase gets the full overall timeout (or none).
//! - Without one, the overall timeout covers both phases.
//!
//! Expiry is reported as [`Elapsed`] carrying the duration of the timer that
//! fired; the dispatcher turns it into a synthesized 504.

use std::future::Future;
use std::time::Duration;

/// Phase of an upstream attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Connect,
    Exchange,
}

impl TimeoutPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeoutPhase::Connect => "connect",
            TimeoutPhase::Exchange => "exchange",
        }
    }
}

/// A phase timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Elapsed {
    pub phase: TimeoutPhase,
    /// Configured duration of the timer that fired.
    pub after: Duration,
}

/// Per-attempt timeout settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeoutPlan {
    pub connect: Option<Duration>,
    pub overall: Option<Duration>,
}

impl TimeoutPlan {
    pub fn new(connect: Option<Duration>, overall: Option<Duration>) -> Self {
        Self { connect, overall }
    }

    /// Timer armed when the connection is initiated.
    pub fn connect_budget(&self) -> Option<Duration> {
        self.connect.or(self.overall)
    }

    /// Timer for the exchange, given how long connecting took.
    ///
    /// Returns the remaining budget and the configured duration to report.
    pub fn exchange_budget(&self, connect_elapsed: Duration) -> Option<(Duration, Duration)> {
        match (self.connect, self.overall) {
            (Some(_), Some(overall)) => Some((overall, overall)),
            (None, Some(overall)) => Some((overall.saturating_sub(connect_elapsed), overall)),
            (_, None) => None,
        }
    }

    /// Duration reported if the connect timer fires.
    fn connect_reported(&self) -> Option<Duration> {
        self.connect.or(self.overall)
    }

    /// Run the connect phase under its timer.
    pub async fn connect<F, T>(&self, future: F) -> Result<T, Elapsed>
    where
        F: Future<Output = T>,
    {
        match (self.connect_budget(), self.connect_reported()) {
            (Some(budget), Some(after)) => tokio::time::timeout(budget, future)
                .await
                .map_err(|_| Elapsed { phase: TimeoutPhase::Connect, after }),
            _ => Ok(future.await),
        }
    }

    /// Run the exchange phase under its timer.
    pub async fn exchange<F, T>(&self, connect_elapsed: Duration, future: F) -> Result<T, Elapsed>
    where
        F: Future<Output = T>,
    {
        match self.exchange_budget(connect_elapsed) {
            Some((budget, after)) => tokio::time::timeout(budget, future)
                .await
                .map_err(|_| Elapsed { phase: TimeoutPhase::Exchange, after }),
            None => Ok(future.await),
        }
    }
}
