//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Upstream attempt:
//!     → timeouts.rs (connect timer, then overall timer)
//!     → On failure or 5xx: retries.rs (classify, consult budget)
//!     → backoff.rs (jittered delay before the next attempt)
//! ```
//!
//! # Design Decisions
//! - Every attempt can carry a deadline; expiry becomes a 504 response
//! - Retries replay a cached body, never a consumed stream
//! - Jittered backoff prevents synchronized retry storms

pub mod backoff;
pub mod retries;
pub mod timeouts;
