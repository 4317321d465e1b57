pub mod memory;
pub mod redis;

pub use self::memory::{MemoryCache, MemoryCacheConfig};
pub use self::redis::{RedisCache, RedisCacheConfig};
