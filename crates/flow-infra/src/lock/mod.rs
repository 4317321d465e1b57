//! Single-flight lock backends

pub mod keyed;
pub mod redis;

pub use self::keyed::KeyedMutexLock;
pub use self::redis::RedisLock;
