//! Service-backed messaging.
//!
//! The in-process queue, bus and scheduler live in `annoflow-events`; this
//! module adds Redis implementations of the same traits.

#[cfg(feature = "redis")]
pub mod redis_delay;
#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_delay::RedisDelayScheduler;
#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;
