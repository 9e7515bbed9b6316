pub mod seen;

pub use seen::{open_seen_store, MemorySeenStore, RedisSeenStore, SeenStore};
