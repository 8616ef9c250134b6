#[cfg(not(target_pointer_width = "64"))]
compile_error!("bytepool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod pool;

// allocator core
pub use pool::arena::{Arena, ArenaConfig, GlobalPool, PoolError, PooledBuf};
pub use pool::chunk::{ChunkId, ChunkMetrics};
pub use pool::handle::Handle;
pub use pool::subpage::SubpageMetrics;

// backing memory
pub use pool::source::{HeapSource, MemorySource, Region};
#[cfg(all(unix, not(any(loom, miri))))]
pub use pool::source::{MmapRegion, MmapSource};

// stats
pub use pool::stats::PoolStats;
