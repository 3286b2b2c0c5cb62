//! Event backend implementations for the dockrion streaming core.

pub mod memory_backend;
#[cfg(feature = "redis")]
pub mod redis_backend;

pub use memory_backend::MemoryBackend;
#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;
