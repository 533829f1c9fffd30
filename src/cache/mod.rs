//! Bounded map with recency reordering. Not thread-safe by itself; callers
//! that share an instance across tasks must synchronize externally (e.g.
//! behind `crate::common::Mutex`).

pub mod lru;

pub use lru::LruCache;
