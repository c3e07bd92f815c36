//! Size-bounded on-disk spool
//!
//! Holds submitted files on disk until they have been delivered. The total
//! size of the spool is bounded by an allocation budget that is enforced
//! while content is still streaming in, and the set of live entries is
//! persisted to an index so it survives restarts.

mod cache;
mod error;
mod limiter;
pub mod safefile;
mod size;
mod types;

pub use cache::{CachedEntry, FileCache, INDEX_FILE_NAME};
pub use error::{CacheError, Result};
pub use limiter::{ByteBudget, LimitWriter, WriteBudget, MIN_ALLOCATION};
pub use safefile::{write_atomic, SafeFile};
pub use size::parse_size;
pub use types::{CacheStats, CachedFile, EntryRecord};
