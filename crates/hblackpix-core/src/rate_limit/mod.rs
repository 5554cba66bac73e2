//! Rate limiting for sensitive mutations.
//!
//! Fixed-window counters keyed by `(identifier, action)`, in two deployments:
//! [`RateLimiter`] keeps counters in key/value storage on the client, and
//! [`SecurityService`] keeps them in SQLite with an audit log. [`GcraLimiter`]
//! is a stricter in-memory alternative.

mod counter;
mod gcra;
mod limiter;
mod policy;
mod security;

pub use counter::{RateLimitCounter, RateLimitDecision};
pub use gcra::GcraLimiter;
pub use limiter::{CounterStore, KeyValueCounterStore, RateLimiter};
pub use policy::RateLimitPolicy;
pub use security::{AuditEvent, AuditOutcome, RiskLevel, SecurityConfig, SecurityService};
