//! Fault tolerance shared by exchange clients
//!
//! - Circuit breaker for a failing exchange
//! - Blocking min-interval rate limiter

pub mod circuit_breaker;
pub mod rate_limiter;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limiter::{RateLimiter, RateLimiterConfig};
