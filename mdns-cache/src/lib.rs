pub mod cache;

pub use cache::{CacheEvent, CacheService, MemoryCacheService};
