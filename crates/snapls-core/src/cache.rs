//! The caching layers of the engine: the content-addressed disk cache, the
//! bounded parse cache, and the in-flight futures cache.

pub mod file;
pub mod future;
pub mod parse;

pub use file::{CacheKind, DiskCache, FileCache, MemCache};
pub use future::{Flavor, FutureCache};
pub use parse::ParseCache;
