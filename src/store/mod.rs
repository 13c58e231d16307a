//! Window store implementations.
//!
//! `MemoryStore` keeps state in process and suits a single instance.
//! `RedisStore` shares state between every instance pointed at one server.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;
