pub mod admission;
pub mod cache;
pub mod cors;
pub mod engine;
pub mod upstream;

pub use admission::RequestClass;
pub use cache::{CacheStore, MemoryStore, RedisStore};
pub use engine::{EdgeProxy, ProxySettings};
pub use upstream::HttpOrigin;
