pub mod compression;

pub use compression::{CacheEntry, CachedSource, Closed, CompressionCache, CompressionStats, Finished, Lookup};
