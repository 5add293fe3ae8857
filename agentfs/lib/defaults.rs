use std::time::Duration;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default size of a file data chunk in the delta store.
pub const DEFAULT_CHUNK_SIZE: u64 = 4096;

/// The default busy timeout for the delta store.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// The default capacity of the dentry resolution cache.
pub const DEFAULT_DENTRY_CACHE_CAPACITY: usize = 10_000;

/// How long the kernel may cache attributes and directory entries.
pub const DEFAULT_ATTR_TTL: Duration = Duration::from_secs(1);

/// The block size reported to the kernel.
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;
